//! Executing a fallible async call under a [`RetryPolicy`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use sitegen_ai::BackendError;

use super::types::RetryPolicy;

/// Classification an error must expose to be retried.
pub trait Retryable {
    fn is_transient(&self) -> bool;

    /// Minimum wait requested by the failing side, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for BackendError {
    fn is_transient(&self) -> bool {
        BackendError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        BackendError::retry_after(self)
    }
}

/// Why [`RetryPolicy::execute`] gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError<E> {
    /// A non-retryable error; returned as soon as it was seen.
    #[error("permanent failure on attempt {attempts}: {error}")]
    Permanent { error: E, attempts: u32 },
    /// Every allowed attempt failed with a transient error.
    #[error("retries exhausted after {attempts} attempts: {error}")]
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// `op` receives the 1-indexed attempt number. Backoff waits are
    /// `tokio::time::sleep`, so the calling task yields instead of blocking a
    /// worker thread. No wait follows the final attempt.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                debug!(attempt, error = %error, "permanent failure, not retrying");
                return Err(RetryError::Permanent {
                    error,
                    attempts: attempt,
                });
            }

            if !self.should_retry(attempt) {
                debug!(attempt, error = %error, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.delay_with_hint(attempt, error.retry_after());
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn always_transient_calls_exactly_max_attempts() {
        let policy = RetryPolicy::reference();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = policy
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Network("connection reset".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        // 1s + 2s of backoff, nothing after the last attempt.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_short_circuits_without_sleeping() {
        let policy = RetryPolicy::reference();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = policy
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::InvalidRequest("prompt too long".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let policy = RetryPolicy::reference();

        let result = policy
            .execute(|attempt| async move {
                if attempt < 3 {
                    Err(BackendError::Timeout(Duration::from_secs(300)))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_extends_the_wait() {
        let policy = RetryPolicy::reference();
        let started = Instant::now();

        let result = policy
            .execute(|attempt| async move {
                if attempt == 1 {
                    Err(BackendError::RateLimited {
                        message: "429".into(),
                        retry_after: Some(Duration::from_secs(3)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }
}
