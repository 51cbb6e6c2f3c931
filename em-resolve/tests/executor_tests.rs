//! Integration tests for the concurrent executor
//!
//! Covers the concurrency bound, timeout retry, slot isolation of fatal
//! errors, cooperative cancellation, start-rate limiting and ordering.

mod helpers;

use em_common::events::{EventBus, ResolveEvent};
use em_common::Telemetry;
use em_resolve::config::{ExecutorSettings, RetryPolicy};
use em_resolve::{Executor, MatchError};
use helpers::ConcurrencyTracker;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn settings(max_concurrency: usize) -> ExecutorSettings {
    ExecutorSettings {
        max_concurrency,
        requests_per_minute: None,
        retry: RetryPolicy::immediate(3),
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ResolveEvent>) -> Vec<ResolveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_at_most_three_in_flight() {
    let tracker = ConcurrencyTracker::new();
    let executor = Executor::new(settings(3)).unwrap();

    let tasks: Vec<_> = (0..10usize)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            move || {
                let tracker = Arc::clone(&tracker);
                async move {
                    let _guard = tracker.enter();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, MatchError>(i)
                }
            }
        })
        .collect();

    let results = executor.run(tasks).await;

    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(tracker.max_in_flight(), 3, "concurrency bound must be reached but never exceeded");
    assert_eq!(tracker.starts().len(), 10);
}

#[tokio::test]
async fn test_results_aligned_with_input_despite_completion_order() {
    let executor = Executor::new(settings(10)).unwrap();
    let delays = [50u64, 5, 40, 10, 30, 0, 20, 15];

    let tasks: Vec<_> = delays
        .iter()
        .enumerate()
        .map(|(i, &delay)| {
            move || async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, MatchError>(format!("task-{}", i))
            }
        })
        .collect();

    let results = executor.run(tasks).await;
    for (i, result) in results.into_iter().enumerate() {
        let outcome = result.unwrap();
        assert_eq!(outcome.index, i);
        assert_eq!(outcome.value, format!("task-{}", i));
    }
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn test_two_timeouts_then_success() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let telemetry = Telemetry::new();
    let executor = Executor::new(settings(2))
        .unwrap()
        .with_events(bus)
        .with_telemetry(telemetry.clone());

    let calls = Arc::new(AtomicU32::new(0));
    let task = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MatchError::Timeout("deadline exceeded".into()))
                } else {
                    Ok("answer")
                }
            }
        }
    };

    let mut results = executor.run(vec![task]).await;
    let outcome = results.remove(0).unwrap();

    assert_eq!(outcome.value, "answer");
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.retries(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let retried: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ResolveEvent::TaskRetried { index: 0, attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retried, vec![1, 2]);

    assert_eq!(telemetry.report().sum("executor.attempts"), 3.0);
}

#[tokio::test]
async fn test_retry_is_bounded() {
    let executor = Executor::new(settings(1)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let task = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MatchError::Timeout("never answers".into()))
            }
        }
    };

    let results = executor.run(vec![task]).await;

    assert!(matches!(
        results[0],
        Err(MatchError::RetriesExhausted { attempts: 3 })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_backoff_delays_retries() {
    let mut slow = settings(1);
    slow.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 20,
        max_backoff_ms: 40,
    };
    let executor = Executor::new(slow).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let task = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MatchError::Timeout("slow".into()))
                } else {
                    Ok(())
                }
            }
        }
    };

    let started = std::time::Instant::now();
    let results = executor.run(vec![task]).await;
    assert!(results[0].is_ok());
    // 20 ms + 40 ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(60));
}

// ============================================================================
// Fatal errors
// ============================================================================

#[tokio::test]
async fn test_fatal_error_fails_only_its_slot() {
    let executor = Executor::new(settings(4)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..5usize)
        .map(|i| {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if i == 2 {
                        Err(MatchError::ToolUnsupported("image input".into()))
                    } else {
                        Ok(i)
                    }
                }
            }
        })
        .collect();

    let results = executor.run(tasks).await;

    assert!(matches!(results[2], Err(MatchError::ToolUnsupported(_))));
    for i in [0, 1, 3, 4] {
        assert_eq!(results[i].as_ref().unwrap().value, i);
    }
    // No retry for non-timeout errors
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_stops_new_starts() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let executor = Executor::new(settings(1)).unwrap().with_events(bus);
    let token = executor.cancel_token();

    let tasks: Vec<_> = (0..5usize)
        .map(|i| {
            let token = token.clone();
            move || {
                let token = token.clone();
                async move {
                    if i == 0 {
                        // Cancel while this task is in flight
                        token.cancel();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok::<_, MatchError>(i)
                }
            }
        })
        .collect();

    let results = executor.run(tasks).await;

    // The in-flight task finishes normally
    assert_eq!(results[0].as_ref().unwrap().value, 0);
    for result in &results[1..] {
        assert!(matches!(result, Err(MatchError::Cancelled)));
    }

    let events = drain(&mut rx);
    assert!(events.contains(&ResolveEvent::BatchCancelled { started: 1, total: 5 }));
}

#[tokio::test]
async fn test_cancelled_executor_starts_nothing() {
    let executor = Executor::new(settings(4)).unwrap();
    executor.cancel();
    assert!(executor.is_cancelled());

    let calls = Arc::new(AtomicU32::new(0));
    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, MatchError>(())
                }
            }
        })
        .collect();

    let failure = executor.try_run(tasks).await.unwrap_err();
    assert!(matches!(failure.error, MatchError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn test_start_rate_is_limited() {
    // 1200 per minute: one start every 50 ms
    let mut limited = settings(8);
    limited.requests_per_minute = Some(1200);
    let executor = Executor::new(limited).unwrap();
    let tracker = ConcurrencyTracker::new();

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            move || {
                let tracker = Arc::clone(&tracker);
                async move {
                    let _guard = tracker.enter();
                    Ok::<_, MatchError>(())
                }
            }
        })
        .collect();

    let results = executor.run(tasks).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let mut starts = tracker.starts();
    starts.sort();
    for window in starts.windows(2) {
        let gap = window[1].duration_since(window[0]);
        assert!(
            gap >= Duration::from_millis(45),
            "task starts only {:?} apart",
            gap
        );
    }
}

#[tokio::test]
async fn test_progress_events_cover_every_task() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let executor = Executor::new(settings(2)).unwrap().with_events(bus);

    let tasks: Vec<_> = (0..4)
        .map(|i| move || async move { Ok::<_, MatchError>(i) })
        .collect();
    executor.run(tasks).await;

    let progress: Vec<(usize, usize)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ResolveEvent::BatchProgress { completed, total } => Some((completed, total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}
