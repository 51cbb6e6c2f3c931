//! Bounded concurrent task executor
//!
//! Runs independent oracle tasks with:
//! - at most `max_concurrency` tasks in flight
//! - at most `requests_per_minute` task starts in any rolling 60 s window
//! - bounded retry with exponential backoff for timeouts
//! - cooperative cancellation (no new starts; in-flight tasks finish)
//!
//! Results are returned aligned with the input order regardless of
//! completion order.
//!
//! # Architecture
//! Tasks are task factories (`FnMut() -> Future`) so a timed-out attempt can
//! be re-issued. Concurrency comes from `futures::stream::buffer_unordered`;
//! the start rate from a `governor` direct limiter with burst 1, shared by
//! every batch the executor runs.

mod retry;

use crate::config::ExecutorSettings;
use crate::error::{MatchError, ResolveError, ResolveResult};
use em_common::events::{EventBus, ResolveEvent};
use em_common::Telemetry;
use futures::stream::{self, StreamExt};
use governor::{Quota, RateLimiter};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Direct (un-keyed) rate limiter type
pub type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Successful task result
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome<T> {
    /// Position of the task in the submitted batch
    pub index: usize,
    pub value: T,
    /// Attempts made, including the first
    pub attempts: u32,
}

impl<T> TaskOutcome<T> {
    /// Timeout retries the task needed
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// First failing task of a fail-fast batch
#[derive(Debug)]
pub struct TaskFailure {
    pub index: usize,
    pub error: MatchError,
}

/// Concurrent task executor
///
/// Cloning shares the rate limiter and cancellation token.
#[derive(Clone)]
pub struct Executor {
    settings: ExecutorSettings,
    rate_limiter: Option<Arc<DirectRateLimiter>>,
    cancel_token: CancellationToken,
    telemetry: Option<Telemetry>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("settings", &self.settings)
            .field("rate_limited", &self.rate_limiter.is_some())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}

impl Executor {
    /// Create an executor after validating its settings
    pub fn new(settings: ExecutorSettings) -> ResolveResult<Self> {
        settings.validate()?;

        let rate_limiter = match settings.requests_per_minute {
            Some(rpm) => {
                // One start per period with burst 1 keeps every rolling
                // 60 s window at or below `rpm` starts
                let period = Duration::from_secs(60) / rpm;
                let quota = Quota::with_period(period).ok_or_else(|| {
                    ResolveError::Config(format!(
                        "executor.requests_per_minute {} is too large",
                        rpm
                    ))
                })?;
                Some(Arc::new(RateLimiter::direct(quota)))
            }
            None => None,
        };

        tracing::debug!(
            max_concurrency = settings.max_concurrency,
            requests_per_minute = ?settings.requests_per_minute,
            max_attempts = settings.retry.max_attempts,
            "Executor created"
        );

        Ok(Self {
            settings,
            rate_limiter,
            cancel_token: CancellationToken::new(),
            telemetry: None,
            events: None,
        })
    }

    /// Record an `executor` span per finished task
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Emit progress, retry and cancellation events
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_ref()
    }

    pub fn events(&self) -> Option<&EventBus> {
        self.events.as_ref()
    }

    /// Token observed before every task start
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Stop issuing new task starts; in-flight tasks run to completion
    pub fn cancel(&self) {
        tracing::info!("Executor cancellation requested");
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Run every task independently
    ///
    /// A fatal error fails only its own slot; other tasks keep running.
    /// Tasks never started because of cancellation yield
    /// `Err(MatchError::Cancelled)`. Output is index-aligned with `tasks`.
    pub async fn run<T, F, Fut>(&self, tasks: Vec<F>) -> Vec<Result<TaskOutcome<T>, MatchError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MatchError>>,
    {
        self.execute(tasks, false).await
    }

    /// Run tasks, stopping new starts after the first fatal error
    ///
    /// In-flight tasks still finish. Returns the lowest-index fatal error if
    /// any task failed, otherwise a cancellation failure if the batch was
    /// cancelled, otherwise every outcome in input order.
    pub async fn try_run<T, F, Fut>(&self, tasks: Vec<F>) -> Result<Vec<TaskOutcome<T>>, TaskFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MatchError>>,
    {
        let results = self.execute(tasks, true).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failure: Option<TaskFailure> = None;
        let mut first_cancelled: Option<usize> = None;

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(MatchError::Cancelled) => {
                    first_cancelled.get_or_insert(index);
                }
                Err(error) => {
                    if failure.is_none() {
                        failure = Some(TaskFailure { index, error });
                    }
                }
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }
        if let Some(index) = first_cancelled {
            return Err(TaskFailure {
                index,
                error: MatchError::Cancelled,
            });
        }
        Ok(outcomes)
    }

    async fn execute<T, F, Fut>(
        &self,
        tasks: Vec<F>,
        fail_fast: bool,
    ) -> Vec<Result<TaskOutcome<T>, MatchError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MatchError>>,
    {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        // Child token: a fail-fast abort stops this batch only
        let batch_token = self.cancel_token.child_token();
        let started = AtomicUsize::new(0);
        let completed = AtomicUsize::new(0);
        let batch_token = &batch_token;
        let started = &started;
        let completed = &completed;

        let mut results: Vec<(usize, Result<TaskOutcome<T>, MatchError>)> =
            stream::iter(tasks.into_iter().enumerate())
                .map(|(index, task)| async move {
                    let result = self.run_task(index, task, batch_token, started).await;

                    match &result {
                        Err(MatchError::Cancelled) => {}
                        Err(error) => {
                            if fail_fast {
                                tracing::warn!(
                                    task = index,
                                    error = %error,
                                    "Task failed, stopping new starts for this batch"
                                );
                                batch_token.cancel();
                            }
                            self.progress(completed, total);
                        }
                        Ok(_) => self.progress(completed, total),
                    }

                    (index, result)
                })
                .buffer_unordered(self.settings.max_concurrency.max(1))
                .collect()
                .await;

        results.sort_by_key(|(index, _)| *index);

        if batch_token.is_cancelled() {
            let started = started.load(Ordering::SeqCst);
            tracing::info!(started, total, "Batch cancelled before all tasks started");
            if let Some(events) = &self.events {
                events.emit_lossy(ResolveEvent::BatchCancelled { started, total });
            }
        }

        results.into_iter().map(|(_, result)| result).collect()
    }

    async fn run_task<T, F, Fut>(
        &self,
        index: usize,
        task: F,
        batch_token: &CancellationToken,
        started: &AtomicUsize,
    ) -> Result<TaskOutcome<T>, MatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MatchError>>,
    {
        // Check cancellation before starting
        if batch_token.is_cancelled() {
            return Err(MatchError::Cancelled);
        }

        if let Some(limiter) = &self.rate_limiter {
            tokio::select! {
                biased;
                _ = batch_token.cancelled() => return Err(MatchError::Cancelled),
                _ = limiter.until_ready() => {}
            }
        }

        started.fetch_add(1, Ordering::SeqCst);
        let begun = Instant::now();

        let events = self.events.clone();
        let (result, attempts) = retry::retry_on_timeout(
            index,
            &self.settings.retry,
            self.rate_limiter.as_deref(),
            |attempt, backoff| {
                if let Some(events) = &events {
                    events.emit_lossy(ResolveEvent::TaskRetried {
                        index,
                        attempt,
                        backoff_ms: backoff.as_millis() as u64,
                    });
                }
            },
            task,
        )
        .await;

        if let Some(telemetry) = &self.telemetry {
            telemetry.record(
                "executor",
                json!({
                    "index": index,
                    "attempts": attempts,
                    "latency": begun.elapsed().as_secs_f64(),
                    "ok": result.is_ok(),
                }),
            );
        }

        result.map(|value| TaskOutcome {
            index,
            value,
            attempts,
        })
    }

    fn progress(&self, completed: &AtomicUsize, total: usize) {
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(events) = &self.events {
            events.emit_lossy(ResolveEvent::BatchProgress {
                completed: done,
                total,
            });
        }
        if done == total || done % 100 == 0 {
            tracing::debug!(progress = format!("{}/{}", done, total), "Executor progress");
        }
    }
}
