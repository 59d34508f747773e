//! Per-message BSM handler.
//!
//! Parses the JSON payload, extracts the redaction-relevant fields from
//! `coreData`, runs the decision pipeline and, for retained messages,
//! re-serializes the document with the configured subtrees nulled out.
//! `serde_json` is built with `preserve_order`, so the output document
//! keeps the key order of the input; the same bytes always produce the
//! same verdict and the same output.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::trace;

use crate::bsm::{self, Bsm};
use crate::geo::Point;
use crate::policy::{FilterPolicy, SuppressReason, Verdict};
use crate::quadtree::Quadtree;

/// What to do with one consumed message
#[derive(Debug)]
pub enum Disposition {
    /// Publish `payload` downstream
    Retain { payload: Vec<u8>, bsm: Bsm },
    /// Drop the message. `bsm` is present when enough of the document
    /// parsed to identify the vehicle.
    Suppress {
        reason: SuppressReason,
        bsm: Option<Bsm>,
    },
}

impl Disposition {
    pub fn verdict(&self) -> Verdict {
        match self {
            Disposition::Retain { .. } => Verdict::Retain,
            Disposition::Suppress { reason, .. } => Verdict::Suppress(*reason),
        }
    }
}

/// Streaming BSM processor. One handler is created per bootstrap generation
/// and reused for every message of that generation; the query buffer makes
/// the hot path allocation-light.
pub struct BsmHandler {
    geofence: Arc<Quadtree>,
    policy: FilterPolicy,
    redact_fields: Vec<String>,
    hits: Vec<u32>,
}

impl BsmHandler {
    pub fn new(geofence: Arc<Quadtree>, policy: FilterPolicy, redact_fields: Vec<String>) -> Self {
        Self {
            geofence,
            policy,
            redact_fields,
            hits: Vec::new(),
        }
    }

    /// Run the decision pipeline over one payload
    pub fn process(&mut self, payload: &[u8]) -> Disposition {
        let mut doc: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                trace!("BSM payload is not valid JSON: {}", e);
                return Disposition::Suppress {
                    reason: SuppressReason::ParseError,
                    bsm: None,
                };
            }
        };

        let Some(root) = doc.as_object() else {
            return Disposition::Suppress {
                reason: SuppressReason::ParseError,
                bsm: None,
            };
        };

        let Some(core) = root.get("coreData").and_then(Value::as_object) else {
            return Disposition::Suppress {
                reason: SuppressReason::MissingRequired,
                bsm: None,
            };
        };

        // Step 1: id validity
        let id = match core.get("id").and_then(Value::as_str).and_then(bsm::validate_id) {
            Some(id) => id,
            None => {
                return Disposition::Suppress {
                    reason: SuppressReason::InvalidId,
                    bsm: None,
                };
            }
        };

        // Step 2: required fields, with sentinel-encoded values counting
        // as absent
        let position = extract_position(core);
        let speed_mps = core
            .get("speed")
            .and_then(Value::as_f64)
            .and_then(bsm::decode_speed);
        let secmark = core
            .get("secMark")
            .and_then(Value::as_u64)
            .and_then(bsm::decode_secmark);
        let heading_deg = core
            .get("heading")
            .and_then(Value::as_f64)
            .and_then(bsm::decode_heading);

        let (Some(position), Some(speed_mps)) = (position, speed_mps) else {
            return Disposition::Suppress {
                reason: SuppressReason::MissingRequired,
                bsm: None,
            };
        };
        if secmark.is_none() {
            return Disposition::Suppress {
                reason: SuppressReason::MissingRequired,
                bsm: None,
            };
        }

        let bsm = Bsm {
            id,
            secmark,
            position,
            speed_mps: Some(speed_mps),
            heading_deg,
        };

        // Step 3: speed bounds
        if !self.policy.speed_in_range(speed_mps) {
            return Disposition::Suppress {
                reason: SuppressReason::SpeedOutOfRange,
                bsm: Some(bsm),
            };
        }

        // Step 4: geofence containment
        self.geofence.query_point(position, &mut self.hits);
        if !self.policy.retains_position(!self.hits.is_empty()) {
            return Disposition::Suppress {
                reason: SuppressReason::OutsideGeofence,
                bsm: Some(bsm),
            };
        }

        // Step 5: redact and re-serialize
        if !self.redact_fields.is_empty() {
            redact_value(&mut doc, &self.redact_fields);
        }
        let payload = serde_json::to_vec(&doc).unwrap_or_default();

        Disposition::Retain { payload, bsm }
    }
}

fn extract_position(core: &Map<String, Value>) -> Option<Point> {
    let pos = core.get("position")?.as_object()?;
    let lat = bsm::decode_latitude(pos.get("latitude")?.as_f64()?)?;
    let lon = bsm::decode_longitude(pos.get("longitude")?.as_f64()?)?;
    Some(Point::new(lat, lon))
}

/// Replace every object member named in `fields` with JSON null, at any
/// depth. The member itself stays, so the document shape is unchanged.
fn redact_value(value: &mut Value, fields: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, member) in map.iter_mut() {
                if fields.iter().any(|f| f == key) {
                    *member = Value::Null;
                } else {
                    redact_value(member, fields);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item, fields);
            }
        }
        _ => {}
    }
}
