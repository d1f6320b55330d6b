//! Bounded retry with exponential backoff for transient storage errors.

use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Upper bound for a single backoff delay.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(BACKOFF_MAX);
        let jitter_ceiling = (backoff.as_millis() as u64) / 5;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        backoff + Duration::from_millis(jitter)
    }

    /// Run `op`, retrying while it fails with a transient error.
    ///
    /// Non-transient errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation,
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result = policy
            .run("flaky write", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::StorageFailure("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: Result<()> = policy
            .run("always failing", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::StorageFailure("down".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::StorageFailure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<()> = RetryPolicy::default()
            .run("lookup", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::JobNotFound(uuid::Uuid::nil()))
            })
            .await;

        assert!(matches!(result, Err(Error::JobNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        assert!(policy.delay_for(20) <= BACKOFF_MAX + BACKOFF_MAX / 5);
        assert_eq!(RetryPolicy::none().delay_for(0), Duration::ZERO);
    }
}
