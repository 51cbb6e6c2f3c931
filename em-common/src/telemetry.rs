//! Telemetry span store with on-demand aggregate statistics
//!
//! Spans are appended by many concurrent producers (executor tasks, oracle
//! calls) and read once at the end of a run.
//!
//! # Architecture
//!
//! - A [`Span`] is a nested JSON mapping tagged by kind. The kind is the first
//!   segment of every metric path that reads from it: a span of kind
//!   `oracle` with body `{"latency": 0.4}` provides a reading for the path
//!   `oracle.latency`.
//! - [`Telemetry`] is a cheap `Clone` handle over a lock-protected epoch.
//!   `start()` archives the current epoch into history and opens a new one.
//! - `stats()` walks every span of the current epoch for every registered
//!   metric path and aggregates `{sum, mean, std, min, max}`. A span missing a
//!   path contributes nothing; a path with no readings aggregates to nulls.
//!
//! Arrays encountered while walking a path fan out: every element is walked
//! with the remaining segments, and a numeric array at the end of a path
//! contributes each element.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Metric paths registered on every new telemetry handle
pub const DEFAULT_METRIC_PATHS: &[&str] = &[
    "oracle.latency",
    "oracle.calls",
    "oracle.input_units",
    "oracle.output_units",
    "executor.attempts",
    "executor.latency",
];

/// A single telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Span kind, e.g. "oracle" or "executor"
    pub kind: String,
    /// Nested readings
    pub body: Value,
    /// When the span was recorded
    pub recorded_at: DateTime<Utc>,
}

impl Span {
    pub fn new(kind: impl Into<String>, body: Value) -> Self {
        Self {
            kind: kind.into(),
            body,
            recorded_at: Utc::now(),
        }
    }

    /// Numeric readings found along a dotted metric path
    pub fn readings(&self, path: &str) -> Vec<f64> {
        let mut segments = path.split('.');
        let mut out = Vec::new();
        if segments.next() == Some(self.kind.as_str()) {
            let rest: Vec<&str> = segments.collect();
            collect_readings(&self.body, &rest, &mut out);
        }
        out
    }
}

fn collect_readings(value: &Value, segments: &[&str], out: &mut Vec<f64>) {
    match (segments.split_first(), value) {
        (_, Value::Array(items)) => {
            for item in items {
                collect_readings(item, segments, out);
            }
        }
        (None, Value::Number(n)) => {
            if let Some(f) = n.as_f64() {
                out.push(f);
            }
        }
        (Some((head, rest)), Value::Object(map)) => {
            if let Some(next) = map.get(*head) {
                collect_readings(next, rest, out);
            }
        }
        _ => {}
    }
}

/// Aggregate statistics for one metric path
///
/// All aggregates are `None` when no span carried a reading for the path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: usize,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    /// Population standard deviation
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl MetricStats {
    pub fn from_readings(readings: &[f64]) -> Self {
        if readings.is_empty() {
            return Self::default();
        }

        let count = readings.len();
        let sum: f64 = readings.iter().sum();
        let mean = sum / count as f64;
        let variance = readings.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / count as f64;
        let min = readings.iter().copied().fold(f64::INFINITY, f64::min);
        let max = readings.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Self {
            count,
            sum: Some(sum),
            mean: Some(mean),
            std: Some(variance.sqrt()),
            min: Some(min),
            max: Some(max),
        }
    }

    /// Sum, or zero when there were no readings
    pub fn sum_or_zero(&self) -> f64 {
        self.sum.unwrap_or(0.0)
    }
}

/// Snapshot of an epoch, produced by [`Telemetry::stop`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub epoch_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the epoch in seconds
    pub duration_secs: f64,
    pub num_spans: usize,
    /// Flattened statistics keyed by metric path
    pub stats: BTreeMap<String, MetricStats>,
}

impl TelemetryReport {
    /// Sum for a metric path, zero when absent
    pub fn sum(&self, path: &str) -> f64 {
        self.stats.get(path).map(MetricStats::sum_or_zero).unwrap_or(0.0)
    }
}

#[derive(Debug)]
struct Epoch {
    id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    stopped: Option<Instant>,
    spans: Vec<Span>,
}

impl Epoch {
    fn open() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            stopped: None,
            spans: Vec::new(),
        }
    }

    fn duration(&self) -> Duration {
        match self.stopped {
            Some(stopped) => stopped.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    epoch: Epoch,
    history: Vec<Vec<Span>>,
    metric_paths: Vec<String>,
}

/// Append-only span store
///
/// Clones share the same store. Writes take a short mutex so producers on
/// many tasks never interleave partial appends.
#[derive(Debug, Clone)]
pub struct Telemetry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Create a store with the default metric paths and an open epoch
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                epoch: Epoch::open(),
                history: Vec::new(),
                metric_paths: DEFAULT_METRIC_PATHS.iter().map(|p| p.to_string()).collect(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a new collection epoch, archiving the current one
    pub fn start(&self) -> Uuid {
        let mut inner = self.lock();
        let previous = std::mem::replace(&mut inner.epoch, Epoch::open());
        inner.history.push(previous.spans);
        tracing::debug!(epoch_id = %inner.epoch.id, "Telemetry epoch started");
        inner.epoch.id
    }

    /// Close the current epoch and return a snapshot report
    ///
    /// Spans added after `stop()` still land in the epoch but do not change
    /// the reported duration.
    pub fn stop(&self) -> TelemetryReport {
        let mut inner = self.lock();
        if inner.epoch.stopped.is_none() {
            inner.epoch.stopped = Some(Instant::now());
        }
        Self::report_locked(&inner)
    }

    /// Current snapshot without closing the epoch
    pub fn report(&self) -> TelemetryReport {
        Self::report_locked(&self.lock())
    }

    fn report_locked(inner: &Inner) -> TelemetryReport {
        TelemetryReport {
            epoch_id: inner.epoch.id,
            started_at: inner.epoch.started_at,
            duration_secs: inner.epoch.duration().as_secs_f64(),
            num_spans: inner.epoch.spans.len(),
            stats: Self::stats_locked(inner),
        }
    }

    /// Independent store with the same metric paths and a fresh epoch
    ///
    /// Spans written to the fork never reach this store until archived.
    pub fn fork(&self) -> Telemetry {
        let metric_paths = self.lock().metric_paths.clone();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                epoch: Epoch::open(),
                history: Vec::new(),
                metric_paths,
            })),
        }
    }

    /// Move the current epoch of `other` into this store's history
    pub fn archive(&self, other: &Telemetry) {
        let spans = {
            let mut source = other.lock();
            std::mem::take(&mut source.epoch.spans)
        };
        self.lock().history.push(spans);
    }

    /// Append a span
    pub fn add(&self, span: Span) {
        self.lock().epoch.spans.push(span);
    }

    /// Build and append a span from a kind and body
    pub fn record(&self, kind: impl Into<String>, body: Value) {
        self.add(Span::new(kind, body));
    }

    /// Register an additional metric path
    pub fn register(&self, path: impl Into<String>) {
        let path = path.into();
        let mut inner = self.lock();
        if !inner.metric_paths.contains(&path) {
            inner.metric_paths.push(path);
        }
    }

    /// Registered metric paths, in registration order
    pub fn metric_paths(&self) -> Vec<String> {
        self.lock().metric_paths.clone()
    }

    /// Wall-clock duration of the current epoch
    pub fn duration(&self) -> Duration {
        self.lock().epoch.duration()
    }

    /// Spans of the current epoch
    pub fn spans(&self) -> Vec<Span> {
        self.lock().epoch.spans.clone()
    }

    /// Number of spans in the current epoch
    pub fn len(&self) -> usize {
        self.lock().epoch.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Archived epochs, oldest first
    pub fn history(&self) -> Vec<Vec<Span>> {
        self.lock().history.clone()
    }

    /// Flattened statistics: metric path -> aggregates
    pub fn stats(&self) -> BTreeMap<String, MetricStats> {
        Self::stats_locked(&self.lock())
    }

    /// Nested statistics: `"oracle.latency"` becomes `{"oracle": {"latency": {..}}}`
    pub fn stats_nested(&self) -> Value {
        let mut root = Map::new();
        for (path, stats) in self.stats() {
            let stats_value = serde_json::to_value(&stats).unwrap_or(Value::Null);
            let segments: Vec<&str> = path.split('.').collect();
            insert_nested(&mut root, &segments, stats_value);
        }
        Value::Object(root)
    }

    fn stats_locked(inner: &Inner) -> BTreeMap<String, MetricStats> {
        inner
            .metric_paths
            .iter()
            .map(|path| {
                let readings: Vec<f64> = inner
                    .epoch
                    .spans
                    .iter()
                    .flat_map(|span| span.readings(path))
                    .collect();
                (path.clone(), MetricStats::from_readings(&readings))
            })
            .collect()
    }
}

fn insert_nested(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_nested(child, rest, value);
            }
        }
    }
}
