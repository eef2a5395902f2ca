//! retry.rs — retry-with-exponential-backoff-and-jitter as a value, not a
//! try/catch ladder (spec §9).
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VaultError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_s: u64) -> Self {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_secs(initial_delay_s.max(1)),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let base = base.min(self.max_delay.as_secs_f64());
        let jitter_span = base * self.jitter;
        let jittered = base + rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

pub enum Outcome<T> {
    Retry(VaultError),
    RetryAfter(VaultError, u64),
    /// Non-retryable: surfaces immediately without consuming the remaining
    /// attempt budget (403/404 on write, permission, payload too large).
    Fatal(VaultError),
    Done(T),
}

/// Runs `op` until it succeeds, exhausts `policy.max_attempts`, or `token`
/// is cancelled. `op` classifies its own errors via the returned [`Outcome`].
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, token: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Outcome<T>>,
{
    let mut last_err = VaultError::Internal("retry: op never ran".into());
    for attempt in 1..=policy.max_attempts {
        if token.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        match op().await {
            Outcome::Done(v) => return Ok(v),
            Outcome::Fatal(e) => return Err(e),
            Outcome::Retry(e) => {
                last_err = e;
                if attempt == policy.max_attempts {
                    break;
                }
                let delay = policy.delay_for(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(VaultError::Cancelled),
                }
            }
            Outcome::RetryAfter(e, retry_after_s) => {
                last_err = e;
                if attempt == policy.max_attempts {
                    break;
                }
                let floor = Duration::from_secs(retry_after_s);
                let delay = policy.delay_for(attempt).max(floor);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(VaultError::Cancelled),
                }
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::new(5, 1);
        let token = CancellationToken::new();
        let result: Result<i32> = retry(&policy, &token, || async { Outcome::Done(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        };
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<i32> = retry(&policy, &token, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Outcome::Retry(VaultError::TransferFailed("transient".into()))
            } else {
                Outcome::Done(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_and_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        };
        let token = CancellationToken::new();
        let result: Result<i32> = retry(&policy, &token, || async {
            Outcome::Retry(VaultError::TransferFailed("down".into()))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let policy = RetryPolicy::new(5, 1);
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<i32> = retry(&policy, &token, || async {
            Outcome::Retry(VaultError::TransferFailed("down".into()))
        })
        .await;
        assert!(matches!(result, Err(VaultError::Cancelled)));
    }
}
