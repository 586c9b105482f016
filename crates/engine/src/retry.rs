//! Bounded retry around calls to the source platform.

use std::{future::Future, time::Duration};

use backoff::{backoff::Constant, future::retry_notify};
use tracing::{info, warn};

use crate::ports::SourceError;

/// Fixed-backoff retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Only transient server failures are retried.
pub fn is_retryable(error: &SourceError) -> bool {
    matches!(error, SourceError::Transient(_))
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
pub async fn retry_source_call<F, Fut, T>(
    policy: RetryPolicy,
    operation_name: &str,
    f: F,
) -> Result<T, SourceError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 0;
    let operation = || {
        attempt += 1;
        let current = attempt;
        let call = f();
        async move {
            match call.await {
                Ok(result) => {
                    if current > 1 {
                        info!(
                            operation = operation_name,
                            attempt = current,
                            "source call succeeded after retry"
                        );
                    }
                    Ok(result)
                }
                Err(error) if !is_retryable(&error) => {
                    warn!(
                        operation = operation_name,
                        error = %error,
                        "source call failed with non-retryable error"
                    );
                    Err(backoff::Error::permanent(error))
                }
                Err(error) if current >= policy.max_attempts => {
                    warn!(
                        operation = operation_name,
                        attempt = current,
                        error = %error,
                        "source call failed after max attempts"
                    );
                    Err(backoff::Error::permanent(error))
                }
                Err(error) => Err(backoff::Error::transient(error)),
            }
        }
    };

    retry_notify(
        Constant::new(policy.backoff),
        operation,
        |error: SourceError, wait: Duration| {
            warn!(
                operation = operation_name,
                error = %error,
                backoff_ms = wait.as_millis() as u64,
                "source call failed, retrying after backoff"
            );
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_transient_errors_up_to_the_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SourceError> =
            retry_source_call(RetryPolicy::new(3, Duration::ZERO), "push", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Transient("502".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permission_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SourceError> =
            retry_source_call(RetryPolicy::new(3, Duration::ZERO), "push", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::PermissionDenied(vec!["tx1".to_string()]))
            })
            .await;

        assert_eq!(
            result,
            Err(SourceError::PermissionDenied(vec!["tx1".to_string()]))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_a_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = retry_source_call(RetryPolicy::new(3, Duration::ZERO), "push", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SourceError::Transient("503".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_single_attempt_policy_never_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SourceError> =
            retry_source_call(RetryPolicy::new(0, Duration::ZERO), "push", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Transient("504".to_string()))
            })
            .await;

        assert_eq!(result, Err(SourceError::Transient("504".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
