//! Exponential backoff for reconnecting endpoints.

use std::future::Future;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::shutdown::Shutdown;

/// Delay schedule between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl BackoffPolicy {
    /// Create a policy. `max` is raised to `initial` if smaller.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay following `current`: doubled, capped at `max`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Run `attempt` until it succeeds, sleeping between failures.
///
/// The first attempt is made immediately. After each failure the wait is
/// `initial`, then doubled up to `max`. Waits are interrupted by `shutdown`,
/// in which case [`BridgeError::ShutdownRequested`] is returned.
pub async fn reconnect_with_backoff<F, Fut, E>(
    policy: &BackoffPolicy,
    shutdown: &Shutdown,
    endpoint: &str,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    let mut delay = policy.initial;
    let mut attempts: u32 = 0;

    loop {
        if shutdown.is_triggered() {
            return Err(BridgeError::ShutdownRequested);
        }

        attempts += 1;
        match attempt().await {
            Ok(()) => {
                if attempts > 1 {
                    tracing::info!(endpoint = %endpoint, attempts, "Reconnected");
                }
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connection attempt failed"
                );
            }
        }

        if !shutdown.sleep(delay).await {
            return Err(BridgeError::ShutdownRequested);
        }
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_next_delay_doubles_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(policy.next_delay(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(policy.next_delay(Duration::from_secs(4)), Duration::from_secs(5));
        assert_eq!(policy.next_delay(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_max_never_below_initial() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = calls.clone();
        let result = reconnect_with_backoff(&policy, &shutdown, "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("refused")
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Attempts at t=0, t=2s and t=6s
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_capped_at_max() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(3));
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = calls.clone();
        reconnect_with_backoff(&policy, &shutdown, "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err("refused")
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        // 1 + 2 + 3 + 3
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(300));
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        let result =
            reconnect_with_backoff(&policy, &shutdown, "test", || async { Err::<(), _>("down") })
                .await;

        assert!(matches!(result, Err(BridgeError::ShutdownRequested)));
        assert!(start.elapsed() < Duration::from_secs(30));
    }
}
