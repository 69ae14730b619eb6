//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often and how patiently to retry a fallible async operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum wall-clock time for a single attempt (milliseconds).
    pub attempt_timeout_ms: u64,
    /// Maximum number of retries (0 = no retries, run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 5_000,
            max_retries: 3,
            backoff_base_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Outcome of [`retry_with_backoff`] after the last attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    /// Error of the final attempt; `None` when it timed out.
    pub last_error: Option<E>,
}

/// Run `op` until it succeeds, `should_retry` rejects its error, or the
/// policy is exhausted. Each attempt is bounded by `attempt_timeout_ms`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_retries + 1;
    let timeout = Duration::from_millis(policy.attempt_timeout_ms);

    for attempt in 1..=max_attempts {
        let last_error = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                if !should_retry(&err) {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: Some(err),
                    });
                }
                Some(err)
            }
            Err(_elapsed) => None,
        };

        if attempt == max_attempts {
            return Err(RetryExhausted {
                attempts: attempt,
                last_error,
            });
        }
        tracing::debug!(attempt, "retrying after backoff");
        tokio::time::sleep(policy.backoff(attempt)).await;
    }

    Err(RetryExhausted {
        attempts: max_attempts,
        last_error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout_ms: 1_000,
            max_retries: 2,
            backoff_base_ms: 1,
        }
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            backoff_base_ms: 100,
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry_with_backoff(&fast(), |_: &String| true, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("flaky".to_string())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_with_backoff(&fast(), |_: &String| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        let exhausted = out.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.last_error.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_with_backoff(&fast(), |_: &String| false, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("conflict".to_string())
        })
        .await;
        assert_eq!(out.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
