//! Shutdown coordination.
//!
//! One [`ShutdownSignal`] is cloned into every long-lived task (consumer
//! loop, dispatcher maintenance, hub heartbeat, HTTP server). When SIGTERM
//! or Ctrl+C arrives, every subscriber is notified and the supervisor in
//! `main` then drains the tasks in reverse dependency order.

use tokio::sync::broadcast;
use tracing::info;

/// Clonable handle to the process-wide shutdown broadcast.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Receiver that fires once shutdown is triggered.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown programmatically (tests, fatal runtime errors).
    pub fn trigger(&self) {
        let _ = self.sender.send(());
    }

    /// Block until a termination signal arrives, then notify all
    /// subscribers.
    pub async fn listen(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }

        self.trigger();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
