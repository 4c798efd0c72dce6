//! Bounded retry for the two I/O boundaries: fetching the game log and
//! dispatching ledger upserts.
//!
//! Every attempt runs under a timeout, attempts are separated by a fixed
//! backoff, and the attempt count is fixed. Exhaustion collapses into a single
//! `SourceUnavailable` error carrying the last cause.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!("{} attempt {}/{} failed: {:#}", what, attempt, attempts, e);
                last_error = format!("{:#}", e);
            }
            Err(_) => {
                warn!(
                    "{} attempt {}/{} timed out after {:?}",
                    what, attempt, attempts, policy.timeout
                );
                last_error = format!("timed out after {:?}", policy.timeout);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(PipelineError::SourceUnavailable {
        source_name: what.to_string(),
        attempts,
        cause: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast_policy(3), "game log", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    anyhow::bail!("HTTP 503")
                }
                Ok(n)
            }
        })
        .await
        .expect("third attempt succeeds");
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_fixed_attempts() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast_policy(2), "game log", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("connection refused")) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match err {
            PipelineError::SourceUnavailable {
                attempts, cause, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(cause.contains("connection refused"));
            }
            other => panic!("expected SourceUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_attempt_counts_as_failure() {
        let err = with_retry(&fast_policy(1), "ledger sink", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }
}
