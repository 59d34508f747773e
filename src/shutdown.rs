//! Process-wide lifecycle flags.
//!
//! Two sentinels drive the runner: `bootstrap` gates the outer reconnect
//! loop, `bsms_available` gates the inner consume loop. The signal handler
//! clears both; the runner resets `bsms_available` at the start of every
//! bootstrap pass. Relaxed ordering is enough since the single runner
//! thread re-reads them every iteration and staleness only delays exit by
//! one poll.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

#[derive(Debug)]
pub struct ShutdownFlags {
    bootstrap: AtomicBool,
    bsms_available: AtomicBool,
}

impl Default for ShutdownFlags {
    fn default() -> Self {
        Self {
            bootstrap: AtomicBool::new(true),
            bsms_available: AtomicBool::new(true),
        }
    }
}

impl ShutdownFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bootstrap(&self) -> bool {
        self.bootstrap.load(Ordering::Relaxed)
    }

    pub fn bsms_available(&self) -> bool {
        self.bsms_available.load(Ordering::Relaxed)
    }

    /// Re-arm the inner loop for a new bootstrap generation
    pub fn reset_available(&self) {
        self.bsms_available.store(true, Ordering::Relaxed);
    }

    /// Stop the inner loop; the outer loop decides whether to reconnect
    pub fn halt_consume(&self) {
        self.bsms_available.store(false, Ordering::Relaxed);
    }

    /// Stop everything; set by the signal handler
    pub fn shutdown(&self) {
        self.bsms_available.store(false, Ordering::Relaxed);
        self.bootstrap.store(false, Ordering::Relaxed);
    }
}

/// Spawn the OS signal listener. SIGINT and SIGTERM both request a
/// graceful drain.
pub fn install_signal_handler(flags: Arc<ShutdownFlags>) {
    tokio::spawn(async move {
        let sigterm = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};
                match signal(SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        error!("cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("cannot listen for SIGINT: {}", e);
                    return;
                }
                info!("SIGINT received, draining");
            }
            _ = sigterm => {
                info!("SIGTERM received, draining");
            }
        }

        flags.shutdown();
    });
}
