//! Error classification traits for retry logic and error handling.
//!
//! These traits allow errors to self-describe their characteristics,
//! enabling generic retry logic and error handling patterns.

use std::time::Duration;

/// Classification of error types for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient errors that may resolve on retry (network issues, timeouts)
    Transient,
    /// Permanent errors that won't resolve on retry (invalid input, constraint violations)
    Permanent,
    /// Resource exhaustion errors (rate limits, pool exhausted, full queues)
    ResourceExhausted,
    /// Configuration errors (missing config, invalid settings)
    Configuration,
    /// Internal errors (bugs, unexpected state)
    Internal,
}

/// Trait for errors that can classify themselves for retry logic.
///
/// # Example
///
/// ```rust,ignore
/// use market_common::error::{ErrorClassification, ErrorCategory};
///
/// match repo.flush(&batch).await {
///     Err(e) if e.is_transient() => schedule_retry(batch, e.suggested_retry_delay()),
///     Err(e) => quarantine(batch, e),
///     Ok(n) => record(n),
/// }
/// ```
pub trait ErrorClassification {
    /// Returns the category of this error
    fn category(&self) -> ErrorCategory;

    /// Returns true if this error is transient and may succeed on retry
    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }

    /// Returns true if this error is permanent and won't succeed on retry
    fn is_permanent(&self) -> bool {
        matches!(self.category(), ErrorCategory::Permanent)
    }

    /// Suggests a delay before retrying, if applicable
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_millis(100)),
            ErrorCategory::ResourceExhausted => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Returns the maximum number of retries suggested for this error
    fn max_retries(&self) -> u32 {
        match self.category() {
            ErrorCategory::Transient => 3,
            ErrorCategory::ResourceExhausted => 5,
            _ => 0,
        }
    }
}

/// Helper function for retry logic with exponential backoff.
///
/// Retries the operation while the returned error reports itself as
/// transient, doubling the delay between attempts up to a 30 second cap.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    E: ErrorClassification + std::fmt::Debug,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    let mut delay = initial_delay;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;

                if !err.is_transient() || attempts >= max_attempts {
                    return Err(err);
                }

                let retry_delay = err.suggested_retry_delay().unwrap_or(delay);
                tokio::time::sleep(retry_delay).await;

                // Exponential backoff with cap
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestError(ErrorCategory);

    impl ErrorClassification for TestError {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    #[test]
    fn test_transient_classification() {
        let err = TestError(ErrorCategory::Transient);
        assert!(err.is_transient());
        assert!(!err.is_permanent());
        assert!(err.suggested_retry_delay().is_some());
    }

    #[test]
    fn test_permanent_classification() {
        let err = TestError(ErrorCategory::Permanent);
        assert!(!err.is_transient());
        assert!(err.is_permanent());
        assert_eq!(err.max_retries(), 0);
        assert!(err.suggested_retry_delay().is_none());
    }

    #[test]
    fn test_resource_exhausted_is_transient() {
        let err = TestError(ErrorCategory::ResourceExhausted);
        assert!(err.is_transient());
        assert_eq!(err.max_retries(), 5);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<u32, TestError> = retry_with_backoff(
            || {
                calls += 1;
                let outcome = if calls < 3 {
                    Err(TestError(ErrorCategory::Transient))
                } else {
                    Ok(42)
                };
                async move { outcome }
            },
            5,
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let mut calls = 0;
        let result: Result<u32, TestError> = retry_with_backoff(
            || {
                calls += 1;
                async move { Err(TestError(ErrorCategory::Permanent)) }
            },
            5,
            Duration::from_millis(1),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
