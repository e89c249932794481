use std::future::Future;
use std::time::Duration;

use leasehold_lease_store::LeaseStoreError;
use tracing::{debug, error, warn};

use crate::Error;

/// Bounded retry with exponential backoff around a single store call.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub operation_timeout: Duration,
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Executes an operation with retry logic and exponential backoff.
    ///
    /// Only errors the store reports as retriable, and per-attempt timeouts,
    /// are retried. Everything else is returned after the first attempt.
    pub async fn run<F, Fut, R, E>(&self, operation: &'static str, attempt: F) -> Result<R, Error<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: LeaseStoreError,
    {
        let mut attempts = 0;
        let mut delay = self.base_delay;

        loop {
            attempts += 1;

            match tokio::time::timeout(self.operation_timeout, attempt()).await {
                Ok(Ok(result)) => {
                    if attempts > 1 {
                        debug!(operation, attempts, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Ok(Err(e)) if !e.is_retriable() => {
                    debug!(operation, error = ?e, "Operation failed with non-retriable error");
                    return Err(Error::Store {
                        operation,
                        source: e,
                    });
                }
                Ok(Err(e)) => {
                    if attempts >= self.max_retries {
                        error!(
                            operation,
                            attempts,
                            error = ?e,
                            "Operation failed after maximum retries"
                        );
                        return Err(Error::MaxRetriesExceeded {
                            operation,
                            attempts,
                            source: e,
                        });
                    }

                    warn!(
                        operation,
                        attempt = attempts,
                        max_attempts = self.max_retries,
                        delay = ?delay,
                        error = ?e,
                        "Operation failed, retrying"
                    );
                }
                Err(_elapsed) => {
                    if attempts >= self.max_retries {
                        error!(
                            operation,
                            attempts,
                            timeout = ?self.operation_timeout,
                            "Operation timed out after maximum retries"
                        );
                        return Err(Error::Timeout {
                            operation,
                            attempts,
                            timeout: self.operation_timeout,
                        });
                    }

                    warn!(
                        operation,
                        attempt = attempts,
                        timeout = ?self.operation_timeout,
                        delay = ?delay,
                        "Operation timed out, retrying"
                    );
                }
            }

            tokio::time::sleep(delay).await;

            // Exponential backoff with 0-10% jitter
            delay = std::cmp::min(
                delay.mul_f64(fastrand::f64().mul_add(0.1, 2.0)),
                self.max_delay,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error as ThisError;
    use tokio::time::Instant;

    #[derive(Debug, ThisError)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("broken")]
        Broken,
    }

    impl LeaseStoreError for TestError {
        fn is_retriable(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    const POLICY: RetryPolicy = RetryPolicy {
        operation_timeout: Duration::from_secs(1),
        max_retries: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(150),
    };

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_errors() {
        let calls = &AtomicUsize::new(0);

        let result = POLICY
            .run("get", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_matches!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = &AtomicUsize::new(0);
        let started = Instant::now();

        let result: Result<(), _> = POLICY
            .run("get", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;

        assert_matches!(
            result,
            Err(Error::MaxRetriesExceeded {
                operation: "get",
                attempts: 3,
                source: TestError::Flaky,
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms, then 200ms capped to 150ms
        assert_eq!(started.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_error_is_returned_immediately() {
        let calls = &AtomicUsize::new(0);

        let result: Result<(), _> = POLICY
            .run("put_if_absent_or_expired", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Broken)
            })
            .await;

        assert_matches!(
            result,
            Err(Error::Store {
                source: TestError::Broken,
                ..
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_time_out() {
        let result: Result<(), Error<TestError>> = POLICY
            .run("get", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert_matches!(
            result,
            Err(Error::Timeout {
                attempts: 3,
                timeout,
                ..
            }) if timeout == Duration::from_secs(1)
        );
    }
}
