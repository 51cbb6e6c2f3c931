//! Timeout retry logic
//!
//! Implements exponential backoff retry for oracle calls that time out.
//! Every other error is returned immediately.

use super::DirectRateLimiter;
use crate::config::RetryPolicy;
use crate::error::MatchError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Retry a task with exponential backoff while it times out
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If timeout:
///    a. If attempts < max_attempts: log WARN, backoff, pass the rate gate, retry
///    b. Otherwise: log ERROR, return `RetriesExhausted`
/// 4. If other error: return error immediately (no retry)
///
/// The caller has already passed the rate gate for the first attempt;
/// later attempts pass it here so retries count against the start rate.
///
/// # Arguments
/// * `task_index` - Task position for logging
/// * `policy` - Attempt bound and backoff schedule
/// * `gate` - Start-rate limiter shared with the executor
/// * `on_retry` - Called with (failed attempt, backoff) before each retry
/// * `operation` - Factory producing one attempt
///
/// # Returns
/// The final result and the number of attempts made
pub(crate) async fn retry_on_timeout<F, Fut, T, R>(
    task_index: usize,
    policy: &RetryPolicy,
    gate: Option<&DirectRateLimiter>,
    mut on_retry: R,
    mut operation: F,
) -> (Result<T, MatchError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MatchError>>,
    R: FnMut(u32, Duration),
{
    let start_time = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if attempt > 1 {
            if let Some(gate) = gate {
                gate.until_ready().await;
            }
            tracing::debug!(task = task_index, attempt, "Retrying oracle task");
        }

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        task = task_index,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Oracle task succeeded after retry"
                    );
                }
                return (Ok(value), attempt);
            }
            Err(err) => {
                if !err.is_retryable() {
                    // Non-timeout error, fail immediately
                    return (Err(err), attempt);
                }

                if attempt >= max_attempts {
                    tracing::error!(
                        task = task_index,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        error = %err,
                        "Oracle task failed: retry limit reached"
                    );
                    return (Err(MatchError::RetriesExhausted { attempts: attempt }), attempt);
                }

                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    task = task_index,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Oracle task timed out, retrying"
                );
                on_retry(attempt, backoff);

                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
