//! Backoff retry for asset installs.
//!
//! A single flaky icon fetch should get a second chance before the
//! install report marks it failed.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Attempt budget and backoff curve for a retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (1 = no retries).
    pub attempts: u32,
    /// Delay before the first retry; doubles on each retry after that.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy for manifest asset fetches during install. Short and cheap:
    /// install runs inside a host-bounded lifecycle event.
    pub fn asset_install() -> Self {
        Self {
            attempts: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Delay before retry number `retry` (1-indexed), capped at
    /// [`max_delay`](Self::max_delay).
    pub fn delay_before(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1);
        match 1u32
            .checked_shl(doublings)
            .and_then(|factor| self.base_delay.checked_mul(factor))
        {
            Some(delay) => delay.min(self.max_delay),
            None => self.max_delay,
        }
    }
}

/// Retry a fallible async operation with exponential backoff.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if attempt >= policy.attempts => {
                warn!(attempt, error = %e, "Giving up after final attempt");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_before(attempt);
                debug!(attempt, ?delay, error = %e, "Attempt failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_install_policy() {
        let policy = RetryPolicy::asset_install();
        assert_eq!(policy.attempts, 2);
        assert!(policy.base_delay < Duration::from_secs(1));
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(policy.delay_before(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_respects_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            ..Default::default()
        };

        assert_eq!(policy.delay_before(1), Duration::from_secs(10));
        // Would be 20s but capped at 15s.
        assert_eq!(policy.delay_before(2), Duration::from_secs(15));
        // Shift overflow territory still caps cleanly.
        assert_eq!(policy.delay_before(40), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let policy = RetryPolicy::default();
        let mut attempts = 0;

        let result: Result<i32, &str> = retry_with_backoff(&policy, || {
            attempts += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, &str> = retry_with_backoff(&policy, || {
            let attempt = attempts_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let policy = RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: Result<i32, &str> =
            retry_with_backoff(&policy, || async { Err("always") }).await;

        assert_eq!(result, Err("always"));
    }
}
