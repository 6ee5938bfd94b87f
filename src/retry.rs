//! Bounded exponential-backoff retry for transient external failures.
//!
//! Logical failures (tests failing, patches not applying) never reach this
//! module; only errors that report themselves as transient are retried.

use std::fmt::Display;
use std::future::Future;

use crate::config::RetryPolicy;
use crate::error::{LlmError, OracleError};

/// Errors that can tell infrastructure hiccups from real failures.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        LlmError::is_transient(self)
    }
}

impl Transient for OracleError {
    fn is_transient(&self) -> bool {
        OracleError::is_transient(self)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or the policy's
/// attempts are used up. The last error is returned on exhaustion.
pub async fn retry_transient<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            tracing::debug!(
                op = label,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                tracing::warn!(
                    op = label,
                    attempt = attempt + 1,
                    max_attempts = max_attempts,
                    error = %err,
                    "Transient error, will retry"
                );
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, OracleError> = retry_transient(&fast_policy(3), "test", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(OracleError::Transient("flaky".to_string()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), OracleError> = retry_transient(&fast_policy(3), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::Transient("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(OracleError::Transient(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_never_retries_fatal_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), LlmError> = retry_transient(&fast_policy(5), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::InsufficientBalance("empty".to_string()))
        })
        .await;

        assert!(matches!(result, Err(LlmError::InsufficientBalance(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
