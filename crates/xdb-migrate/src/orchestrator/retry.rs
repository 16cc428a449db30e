//! Bounded exponential backoff for per-batch operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};

/// How often and how patiently a failed batch is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for one batch read or write.
    pub batch_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&MigrationConfig> for RetryPolicy {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            max_retries: config.get_max_retries(),
            base_delay: Duration::from_millis(config.get_retry_base_delay_ms()),
            max_delay: Duration::from_millis(config.get_retry_max_delay_ms()),
            batch_timeout: Duration::from_secs(config.get_batch_timeout_secs()),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether `error` on attempt `attempt` (0-based) may be retried.
    pub fn should_retry(&self, error: &MigrateError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }

    /// Run `op` under the batch timeout. Expiry is a transient `Timeout`.
    pub async fn with_timeout<T, F>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.batch_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(MigrateError::Timeout {
                operation: operation.to_string(),
                seconds: self.batch_timeout.as_secs(),
            }),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// Each attempt runs under the batch timeout.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match self.with_timeout(operation, op()).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        operation, e, attempt, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            batch_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(64), Duration::from_secs(30));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::from(&MigrationConfig::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.batch_timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast()
            .run("write", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MigrateError::write("t", "deadlock", true))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast()
            .run("write", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MigrateError::write("t", "deadlock", true))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast()
            .run("write", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MigrateError::write("t", "duplicate key", false))
            })
            .await;
        assert!(matches!(result, Err(MigrateError::Write { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let mut policy = fast();
        policy.max_retries = 0;
        let result: Result<()> = policy
            .run("slow write", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, MigrateError::Timeout { .. }));
        assert!(err.is_transient());
    }
}
