//! Bounded exponential backoff for provisioning calls.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProvisionError, ProvisionResult};

/// How often and how patiently a provisioning call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base doubled each
    /// time, capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Returns the last error on exhaustion.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> ProvisionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProvisionResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ ProvisionError::Permanent(_)) => {
                    warn!(op = op_name, error = %e, "permanent provisioning error, not retrying");
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    warn!(op = op_name, attempts, error = %e, "provisioning retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt - 1);
                    debug!(op = op_name, attempt, ?delay, error = %e, "provisioning call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(200), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("launch", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProvisionError::Transient("throttled".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: ProvisionResult<()> = fast(3)
            .run("launch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProvisionError::Transient("no capacity".into()))
            })
            .await;
        assert!(matches!(result, Err(ProvisionError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ProvisionResult<()> = fast(5)
            .run("launch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProvisionError::Permanent("bad image".into()))
            })
            .await;
        assert!(matches!(result, Err(ProvisionError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let _ = fast(0)
            .run("terminate", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProvisionError::Transient("x".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
