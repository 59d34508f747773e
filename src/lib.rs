//! PPM - Privacy Protection Module.
//!
//! A stream processor that sits between a vehicle-telemetry ingestion bus
//! and downstream consumers: it reads JSON Basic Safety Messages from an
//! input topic, applies geofence and data-based privacy redactions, and
//! republishes retained messages to an output topic.

pub mod broker;
pub mod bsm;
pub mod config;
pub mod geo;
pub mod handler;
pub mod kafka;
pub mod logging;
pub mod policy;
pub mod quadtree;
pub mod runner;
pub mod shapes;
pub mod shutdown;

pub use bsm::Bsm;
pub use config::{CliOverrides, PpmConfig};
pub use handler::{BsmHandler, Disposition};
pub use policy::{FilterMode, FilterPolicy, SuppressReason, Verdict};
pub use quadtree::Quadtree;
pub use runner::{PpmCounters, RunnerState, StreamRunner};
pub use shutdown::ShutdownFlags;
