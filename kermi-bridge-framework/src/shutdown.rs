//! Cooperative shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A cloneable shutdown flag that long waits can be raced against.
///
/// One instance is created per bridge run and handed to every component that
/// sleeps: the poll loop, reconnection backoff and the settle delay.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self, so this cannot fail.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_trigger_is_visible_to_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());

        shutdown.trigger();
        shutdown.trigger();
        assert!(clone.is_triggered());
    }

    #[test]
    fn test_triggered_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let mut waiter = task::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.triggered().await }
        });

        assert_pending!(waiter.poll());
        shutdown.trigger();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_trigger() {
        let shutdown = Shutdown::new();
        let start = tokio::time::Instant::now();
        assert!(shutdown.sleep(Duration::from_secs(30)).await);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_trigger() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let start = tokio::time::Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(300)).await);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
