//! Interrupt handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run's token. The lifecycle polls that token between
//! states and while external tools run, stops the current step and tears down
//! whatever the current archive holds before the process exits.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Token cancelled on the first signal.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token. Returns early
    /// without cancelling if the token is cancelled elsewhere first.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), stopping after cleanup...");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping after cleanup...");
            }
            _ = self.cancel.cancelled() => return,
        }

        self.cancel.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
