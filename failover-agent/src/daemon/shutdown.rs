//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A single [`CancellationToken`] fans the signal out to the scheduler, the
//! replication listener and the status API. An in-flight run is aborted and
//! recorded as failed; its pooled connection is closed, not returned.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by every long-running task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT (or an internal trigger), then cancel the token.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                info!("Shutdown requested internally");
            }
        }

        self.token.cancel();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_internal_trigger_ends_signal_wait() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();
        coordinator.wait_for_signal().await.unwrap();
        assert!(coordinator.token().is_cancelled());
    }
}
