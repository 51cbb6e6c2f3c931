//! Test oracles and concurrency trackers

use em_resolve::oracle::Oracle;
use em_resolve::types::{Decision, Pair, Record};
use em_resolve::MatchError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Script = dyn Fn(&Pair) -> Result<Decision, MatchError> + Send + Sync;

/// Oracle answering each pair through a closure
///
/// Records every pair it is asked about, in invocation order.
pub struct ScriptedOracle {
    name: String,
    script: Box<Script>,
    confidence: bool,
    delay: Duration,
    invocations: AtomicUsize,
    seen: Mutex<Vec<Pair>>,
}

impl ScriptedOracle {
    pub fn new(
        name: &str,
        script: impl Fn(&Pair) -> Result<Decision, MatchError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            confidence: true,
            delay: Duration::ZERO,
            invocations: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Report no confidence support
    pub fn without_confidence(mut self) -> Self {
        self.confidence = false;
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `invoke` calls (batches)
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Every pair decided so far
    pub fn seen(&self) -> Vec<Pair> {
        self.seen.lock().unwrap().clone()
    }

    /// Left-record text of every pair decided so far
    pub fn seen_left(&self) -> Vec<String> {
        self.seen().iter().map(|p| text(&p.left)).collect()
    }
}

#[async_trait::async_trait]
impl Oracle for ScriptedOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_confidence(&self) -> bool {
        self.confidence
    }

    async fn invoke(&self, pairs: &[Pair]) -> Result<Vec<Decision>, MatchError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().unwrap().extend(pairs.iter().cloned());
        pairs.iter().map(|pair| (self.script)(pair)).collect()
    }
}

/// Text of a text record (empty for field records)
pub fn text(record: &Record) -> String {
    match record {
        Record::Text(t) => t.clone(),
        Record::Fields(_) => String::new(),
    }
}

/// Tracks how many tasks run at once and when each one started
#[derive(Default)]
pub struct ConcurrencyTracker {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

/// Leaves the tracker when dropped
pub struct TrackerGuard(Arc<ConcurrencyTracker>);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a task start
    pub fn enter(self: &Arc<Self>) -> TrackerGuard {
        self.starts.lock().unwrap().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        TrackerGuard(Arc::clone(self))
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }
}
