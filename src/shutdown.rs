//! Graceful shutdown coordination.
//!
//! A single [`ShutdownSignal`] is cloned into every task: the publisher,
//! each pull consumer, the stats aggregator and the telemetry server. Tasks
//! observe it at the top of their wait state, so a batch that is already
//! being fetched, delivered or acknowledged always runs to completion.
//!
//! # Example
//!
//! ```rust,ignore
//! use firehose_fanout::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let worker_shutdown = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             biased;
//!             _ = worker_shutdown.cancelled() => break,
//!             _ = tick.tick() => { /* process one batch */ }
//!         }
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
///
/// Clones share one underlying token. [`ShutdownSignal::child`] derives a
/// signal that fires with its parent but can also be fired on its own,
/// which is how individual consumers are stopped.
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Get the shutdown timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM or Ctrl+C, then trigger shutdown.
    ///
    /// Also returns if shutdown is triggered programmatically first.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Check if shutdown has been triggered. Non-blocking.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown triggered programmatically");
        }
        self.token.cancel();
    }

    /// Derive a signal that fires with this one, or on its own trigger.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            timeout: self.timeout,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
