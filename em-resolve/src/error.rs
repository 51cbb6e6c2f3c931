//! Error types for em-resolve
//!
//! Two layers:
//! - [`MatchError`] describes why a single oracle call (or executor task)
//!   failed. Only `Timeout` is recovered internally, by the executor.
//! - [`ResolveError`] is what cascade and clustering callers see. It carries
//!   the stage and pair index needed to reproduce the failure.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single oracle invocation
#[derive(Debug, Error)]
pub enum MatchError {
    /// The oracle did not answer in time (retryable)
    #[error("Oracle call timed out: {0}")]
    Timeout(String),

    /// The oracle cannot serve this request (fatal)
    #[error("Tool unsupported: {0}")]
    ToolUnsupported(String),

    /// Malformed pair, record, or oracle response (fatal)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The batch was cancelled before this task started
    #[error("Task cancelled before start")]
    Cancelled,

    /// Every allowed attempt timed out
    #[error("Oracle call timed out on all {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made, including the first
        attempts: u32,
    },

    /// Opaque collaborator failure (fatal)
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

impl MatchError {
    /// Timeout helper used by oracle implementations wrapping a deadline
    pub fn timeout_after(limit: Duration) -> Self {
        MatchError::Timeout(format!("no response within {:?}", limit))
    }

    /// Whether the executor may attempt the task again
    pub fn is_retryable(&self) -> bool {
        matches!(self, MatchError::Timeout(_))
    }
}

/// Failure of a cascade or clustering run
#[derive(Debug, Error)]
pub enum ResolveError {
    /// An oracle stage failed; the whole stage is aborted
    #[error("{stage} stage failed at pair {pair_index}: {source}")]
    Stage {
        /// Stage label ("prematch", "match", "cluster")
        stage: String,
        /// Index of the failing pair in the caller's input order
        pair_index: usize,
        #[source]
        source: MatchError,
    },

    /// Input rejected before any oracle call
    #[error("Invalid pair {index}: {reason}")]
    Validation { index: usize, reason: String },

    /// Invalid configuration or unresolved oracle name
    #[error("Configuration error: {0}")]
    Config(String),

    /// em-common error
    #[error("Common error: {0}")]
    Common(#[from] em_common::Error),
}

impl ResolveError {
    /// Translate the pair index of a stage error from a subset back to the
    /// caller's input order
    pub fn remap_pair_index(self, map: impl Fn(usize) -> usize) -> Self {
        match self {
            ResolveError::Stage {
                stage,
                pair_index,
                source,
            } => ResolveError::Stage {
                stage,
                pair_index: map(pair_index),
                source,
            },
            ResolveError::Validation { index, reason } => ResolveError::Validation {
                index: map(index),
                reason,
            },
            other => other,
        }
    }

    /// Underlying oracle error, if this is a stage failure
    pub fn match_error(&self) -> Option<&MatchError> {
        match self {
            ResolveError::Stage { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for resolution runs
pub type ResolveResult<T> = Result<T, ResolveError>;
