//! Retry utilities with exponential backoff and jitter
//!
//! Used by callers that want to retry retryable allocation failures
//! (`LockTimeout`, `PersistenceFailure`) and by the optimistic SQLite store
//! between compare-and-swap attempts.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt)
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double each time)
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0); the delay varies by up to this fraction either way
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::allocation()
    }
}

impl RetryConfig {
    /// Backoff for retrying a whole allocation after contention
    pub fn allocation() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Short backoff between optimistic compare-and-swap attempts
    pub fn compare_and_swap() -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter > 0.0 {
            let jitter_range = capped_delay * self.jitter;
            let jitter_offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter_offset).max(0.0)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error)
    pub result: Result<T, E>,
    /// Number of attempts made (1 = succeeded on first try)
    pub attempts: u32,
    /// Total time spent on retries (including delays)
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// A retry executor that can run operations with retry logic
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run an operation, retrying while `should_retry` accepts the error.
    pub async fn run_with_predicate<F, Fut, T, E, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(
                            attempts,
                            duration_ms = start.elapsed().as_millis(),
                            "Operation succeeded after retries"
                        );
                    }
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                        total_duration: start.elapsed(),
                    };
                }
                Err(e) => {
                    if attempts > self.config.max_retries || !should_retry(&e) {
                        return RetryResult {
                            result: Err(e),
                            attempts,
                            total_duration: start.elapsed(),
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempts - 1);

                    tracing::warn!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Operation failed, will retry"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Check if a database error is transient
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        // Connection errors are usually transient
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            if db_err
                .try_downcast_ref::<sqlx::sqlite::SqliteError>()
                .is_some()
            {
                return is_sqlite_busy_code(&code);
            }
            // PostgreSQL serialization failure
            code == "40001"
                // PostgreSQL deadlock detected
                || code == "40P01"
                // PostgreSQL lock_not_available
                || code == "55P03"
                // Connection exceptions
                || code.starts_with("08")
                // Operator intervention (admin disconnected, crash recovery)
                || code.starts_with("57")
        }
        _ => false,
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED, primary or extended (primary code in the low byte)
pub(crate) fn is_sqlite_busy_code(code: &str) -> bool {
    code.parse::<i64>()
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
            max_retries: 5,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::allocation()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(0.5);

        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(49));
            assert!(delay <= Duration::from_millis(151));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(
            RetryConfig::allocation()
                .with_max_retries(5)
                .with_initial_delay(Duration::from_millis(1)),
        );

        let count = attempt_count.clone();
        let result = retry
            .run_with_predicate(
                || {
                    let count = count.clone();
                    async move {
                        let attempt = count.fetch_add(1, Ordering::SeqCst);
                        if attempt < 2 {
                            Err("not yet")
                        } else {
                            Ok(42)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let retry = Retry::new(
            RetryConfig::allocation()
                .with_max_retries(2)
                .with_initial_delay(Duration::from_millis(1)),
        );

        let result = retry
            .run_with_predicate(|| async { Err::<i32, _>("always fails") }, |_| true)
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap_err(), "always fails");
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_error() {
        #[derive(Debug, PartialEq)]
        enum TestError {
            Retryable,
            Fatal,
        }

        impl std::fmt::Display for TestError {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:?}", self)
            }
        }

        let attempt_count = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(
            RetryConfig::allocation()
                .with_max_retries(5)
                .with_initial_delay(Duration::from_millis(1)),
        );

        let count = attempt_count.clone();
        let result: RetryResult<i32, TestError> = retry
            .run_with_predicate(
                || {
                    let count = count.clone();
                    async move {
                        if count.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(TestError::Retryable)
                        } else {
                            Err(TestError::Fatal)
                        }
                    }
                },
                |e| *e == TestError::Retryable,
            )
            .await;

        assert_eq!(result.attempts, 2);
        assert_eq!(result.into_result().unwrap_err(), TestError::Fatal);
    }

    #[test]
    fn test_sqlite_busy_codes() {
        assert!(is_sqlite_busy_code("5"));
        assert!(is_sqlite_busy_code("6"));
        // SQLITE_BUSY_SNAPSHOT
        assert!(is_sqlite_busy_code("517"));
        assert!(!is_sqlite_busy_code("19"));
        assert!(!is_sqlite_busy_code("40001"));
    }
}
