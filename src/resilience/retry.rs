// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Only errors whose type says they are transient are retried; anything
//! else propagates on the first attempt. Retryability is a property of the
//! error type ([`Retryable`]), never of its message text.
//!
//! # Example
//!
//! ```
//! use replica_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, 3);
//! assert_eq!(query.delay_for(0), Duration::from_millis(100));
//! assert_eq!(query.delay_for(1), Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Errors that know whether trying again could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Configuration for operation retry behavior.
///
/// `max_retries` is the total number of attempts, including the first.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual store calls.
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Repair writes: `max_retries` attempts starting at `base_delay`.
    #[must_use]
    pub fn repair(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            initial_delay: base_delay,
            max_delay,
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Backoff before retry number `attempt + 1`: `initial_delay * factor^attempt`, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Result of a retried operation plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: usize,
}

/// Run `operation` with retries, returning only the result.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    retry_counted(operation_name, config, operation).await.result
}

/// Run `operation` with retries, reporting the attempt count.
pub async fn retry_counted<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let max = config.max_retries.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(val) => {
                if attempts > 1 {
                    info!("Operation '{}' succeeded on attempt {}", operation_name, attempts);
                }
                return RetryOutcome { result: Ok(val), attempts };
            }
            Err(err) => {
                if !err.is_retryable() {
                    warn!(
                        "Operation '{}' failed permanently (attempt {}/{}): {}",
                        operation_name, attempts, max, err
                    );
                    return RetryOutcome { result: Err(err), attempts };
                }

                if attempts >= max {
                    warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Giving up",
                        operation_name, attempts, max, err
                    );
                    crate::metrics::record_retry_exhausted(operation_name);
                    return RetryOutcome { result: Err(err), attempts };
                }

                let delay = config.delay_for((attempts - 1) as u32);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, max, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        msg: String,
        transient: bool,
    }

    impl TestError {
        fn transient(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: true }
        }

        fn permanent(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: false }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.msg)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.transient
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let outcome: RetryOutcome<i32, TestError> =
            retry_counted("test_op", &RetryConfig::test(), || async { Ok(42) }).await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let outcome: RetryOutcome<i32, TestError> = retry_counted(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError::transient("database is locked"))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let outcome: RetryOutcome<i32, TestError> = retry_counted(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    // Message looks transient, but the type says otherwise
                    Err(TestError::permanent("timeout"))
                }
            },
        ).await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(TestError::transient(&format!("fail {}", n)))
                }
            },
        ).await;

        // Last error is the one returned
        assert_eq!(result.unwrap_err().msg, "fail 3");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_retries: 5,
        };

        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_retries: 5,
        };

        assert_eq!(config.delay_for(1), Duration::from_secs(5));
        assert_eq!(config.delay_for(200), Duration::from_secs(5));
    }

    #[test]
    fn test_repair_preset_never_zero_attempts() {
        let config = RetryConfig::repair(0, Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(config.max_retries, 1);
    }
}
