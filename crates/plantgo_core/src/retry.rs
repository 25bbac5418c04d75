//! crates/plantgo_core/src/retry.rs
//!
//! Bounded retries for store writes and collaborator calls.

use crate::ports::{PortError, PortResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with doubling backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempts run out.
    /// Only `PortError::Unexpected` is retried. When `timeout` is set, each
    /// attempt that exceeds it counts as a transient failure.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        timeout: Option<Duration>,
        mut op: F,
    ) -> PortResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PortResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(PortError::Unexpected(format!(
                        "{} timed out after {:?}",
                        what, limit
                    ))),
                },
                None => op().await,
            };

            match result {
                Err(PortError::Unexpected(reason)) if attempt < attempts => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        attempt,
                        ?backoff,
                        "{} failed, retrying: {}",
                        what,
                        reason
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 4,
            initial_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = &AtomicU32::new(0);
        let result = policy(3)
            .run("op", None, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PortError::Unexpected("down".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_budget() {
        let calls = &AtomicU32::new(0);
        let result: PortResult<()> = policy(2)
            .run("op", None, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PortError::Unexpected("down".to_string()))
            })
            .await;
        assert!(matches!(result, Err(PortError::Unexpected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: PortResult<()> = policy(5)
            .run("op", None, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PortError::NotFound("gone".to_string()))
            })
            .await;
        assert!(matches!(result, Err(PortError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let result: PortResult<()> = policy(1)
            .run("slow", Some(Duration::from_millis(5)), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(PortError::Unexpected(_))));
    }
}
