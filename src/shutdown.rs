//! Graceful shutdown coordination for tickpipe.
//!
//! A [`ShutdownSignal`] lets the ingest server and dispatch workers drain
//! in-flight events before exiting when a termination signal arrives.
//!
//! # Example
//!
//! ```rust,ignore
//! use tickpipe::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let mut receiver = shutdown.subscribe();
//!
//! loop {
//!     tokio::select! {
//!         _ = receiver.recv() => break,
//!         // ... read and dispatch events
//!     }
//! }
//! ```

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
///
/// When SIGTERM or SIGINT is received, every component holding a clone of
/// this signal is notified to finish its current batch and stop.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a shutdown signal with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a shutdown signal with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender, timeout }
    }

    /// The configured shutdown timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for a termination signal (SIGTERM or SIGINT), then notify all
    /// subscribers.
    pub async fn wait(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
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
        }

        let _ = self.sender.send(());
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown programmatically (used by tests and operator tooling).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        let _ = self.sender.send(());
    }

    /// Wait for shutdown, bounded by a timeout.
    ///
    /// Returns `true` if the signal arrived within the timeout.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        let mut receiver = self.sender.subscribe();

        tokio::select! {
            _ = receiver.recv() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout reached, forcing shutdown"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_custom_timeout() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(60));
        assert_eq!(signal.timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_clone_receives_signal() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();

        let mut receiver1 = signal.subscribe();
        let mut receiver2 = signal2.subscribe();

        signal.trigger();

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_with_timeout_expires() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_with_timeout(Duration::from_millis(20)).await);
    }
}
