//! Progress events for resolution runs
//!
//! Provides shared event definitions and EventBus for executor, cascade and
//! clustering progress reporting.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Resolution progress event types
///
/// Events are broadcast via EventBus and can be serialized for streaming to
/// a reporting frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResolveEvent {
    /// A cascade or clustering stage started issuing oracle calls
    StageStarted {
        /// Stage label ("prematch", "match", "cluster")
        stage: String,
        /// Number of pairs submitted to the stage
        pairs: usize,
        /// When the stage started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A stage finished (successfully) with all results collected
    StageCompleted {
        /// Stage label
        stage: String,
        /// Number of pairs decided
        pairs: usize,
        /// Wall-clock time spent in the stage
        elapsed_ms: u64,
    },

    /// Executor progress
    BatchProgress {
        /// Tasks finished so far
        completed: usize,
        /// Total tasks in the batch
        total: usize,
    },

    /// A task timed out and will be attempted again
    TaskRetried {
        /// Index of the task in submission order
        index: usize,
        /// Attempt number that failed (1-based)
        attempt: u32,
        /// Delay before the next attempt
        backoff_ms: u64,
    },

    /// The batch was cancelled; no further tasks will start
    BatchCancelled {
        /// Tasks that had started before cancellation was observed
        started: usize,
        /// Total tasks in the batch
        total: usize,
    },

    /// A "no" decision contradicted an existing cluster
    TransitivityViolation {
        /// Index of the candidate pair in block order
        pair_index: usize,
        /// Cluster both endpoints already belong to
        cluster_id: usize,
    },
}

/// Central event distribution bus
///
/// Thin wrapper around a tokio broadcast channel. Cloning the bus shares the
/// same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResolveEvent>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers
    ///   start dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ResolveEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ResolveEvent,
    ) -> Result<usize, broadcast::error::SendError<ResolveEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ResolveEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
