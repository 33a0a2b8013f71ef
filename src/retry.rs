//! Timeout and exponential backoff for outbound network calls.
//!
//! Both the completion client and the embedding client go through
//! [`with_retry`]: every attempt is bounded by the policy timeout, retryable
//! failures are retried with backoff, and the last error is returned once the
//! attempt budget is spent.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Errors that know whether another attempt could succeed.
pub trait Retryable: Sized {
    /// Whether the failure is transient (timeouts, 5xx, rate limits, connection errors).
    fn is_retryable(&self) -> bool;

    /// Build the error reported when an attempt exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Retry and timeout settings for one kind of outbound call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum backoff cap.
    pub max_delay: Duration,
    /// Multiplier per consecutive failure (typically 2.0).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Run `op` under `timeout`, retrying transient failures according to `policy`.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(timeout)),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= attempts {
            if attempt > 1 {
                tracing::error!("{} failed after {} attempts: {}", label, attempt, err);
            }
            return Err(err);
        }

        let delay = jitter(policy.delay_for(attempt - 1));
        tracing::warn!(
            "{} attempt {}/{} failed: {}; retrying in {:?}",
            label,
            attempt,
            attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

/// Add up to 10% random jitter.
fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0..1.1);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum FakeError {
        Transient,
        Permanent,
        TimedOut,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            !matches!(self, FakeError::Permanent)
        }

        fn timed_out(_after: Duration) -> Self {
            FakeError::TimedOut
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, FakeError> =
            with_retry(&RetryPolicy::immediate(3), Duration::from_secs(1), "test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeError::Transient)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.expect("third attempt succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FakeError> =
            with_retry(&RetryPolicy::immediate(5), Duration::from_secs(1), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Permanent) }
            })
            .await;
        assert!(matches!(result, Err(FakeError::Permanent)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_against_the_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FakeError> =
            with_retry(&RetryPolicy::immediate(2), Duration::from_millis(10), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(FakeError::TimedOut)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
