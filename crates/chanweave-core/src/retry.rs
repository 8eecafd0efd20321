//! Bounded retry with linear backoff
//!
//! Every substrate-mutating call goes through [`retry`]. The substrate may
//! report failure for an operation that nonetheless committed, so callers must
//! only pass operations that are idempotent or check for prior success.

use std::future::Future;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{ChannelError, ChannelResult};

/// Run `operation` until it succeeds or `policy.max_attempts` is spent.
///
/// Failed attempt `n` waits `n * base_delay` before the next one. Errors that
/// are not transient (see [`ChannelError::is_transient`]) are returned
/// immediately without consuming the rest of the budget. When the budget is
/// spent the last error is wrapped in [`ChannelError::RetriesExhausted`].
pub async fn retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    target: &str,
    mut operation: F,
) -> ChannelResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ChannelResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        target, attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = operation_name,
                    target,
                    attempt,
                    error = %e,
                    "Operation failed after all retries"
                );
                return Err(ChannelError::RetriesExhausted {
                    operation: operation_name.to_string(),
                    target: target.to_string(),
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = operation_name,
                    target,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_try_without_delay() {
        let start = Instant::now();
        let result = retry(&policy(3), "op", "t-1", |_| async { Ok::<_, ChannelError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_schedule() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let c = calls.clone();
        let result = retry(&policy(4), "op", "t-1", move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ChannelError::SubstrateUnavailable("down".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 300
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600));
        assert!(elapsed < Duration::from_millis(610));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error_with_context() {
        let result: ChannelResult<()> = retry(&policy(3), "create_topic", "t-2", |attempt| async move {
            Err(ChannelError::SubstrateUnavailable(format!("attempt {}", attempt)))
        })
        .await;

        match result.unwrap_err() {
            ChannelError::RetriesExhausted {
                operation,
                target,
                attempts,
                last,
            } => {
                assert_eq!(operation, "create_topic");
                assert_eq!(target, "t-2");
                assert_eq!(attempts, 3);
                assert_eq!(*last, ChannelError::SubstrateUnavailable("attempt 3".into()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: ChannelResult<()> = retry(&policy(5), "grant", "t-1", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ChannelError::InvalidPrincipal("bob".into())) }
        })
        .await;

        assert!(matches!(result, Err(ChannelError::InvalidPrincipal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
