//! Long-run alerting.
//!
//! A watchdog never cancels anything; it only reports runs that outlive
//! the configured ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    ceiling: Duration,
}

impl Watchdog {
    pub fn new(ceiling: Duration) -> Self {
        Self { ceiling }
    }

    /// Arm the watchdog for one run. Dropping the guard disarms it.
    pub fn start(&self, label: impl Into<String>) -> WatchdogGuard {
        let label = label.into();
        let ceiling = self.ceiling;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            flag.store(true, Ordering::SeqCst);
            error!(run = %label, ceiling_secs = ceiling.as_secs(), "Run exceeded the watchdog ceiling and is still going");
        });
        WatchdogGuard { handle, fired }
    }
}

pub struct WatchdogGuard {
    handle: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl WatchdogGuard {
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_alert_after_ceiling() {
        let watchdog = Watchdog::new(Duration::from_secs(60));
        let guard = watchdog.start("target t1");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!guard.fired());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(guard.fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_never_fires() {
        let watchdog = Watchdog::new(Duration::from_secs(10));
        let guard = watchdog.start("target t2");
        let fired = guard.fired.clone();
        drop(guard);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
