//! em-resolve library interface
//!
//! Entity resolution core: bounded concurrent oracle execution, a two-stage
//! confidence cascade with calibration, and clustering consolidation of
//! pairwise decisions.
//!
//! # Architecture
//! - [`executor`]: concurrency bound, start-rate gate, timeout retry, cancellation
//! - [`oracle`]: pair-matching collaborators and their registry
//! - [`matching`]: batched oracle invocation through the executor
//! - [`cascade`]: prematch → match routing by confidence threshold
//! - [`block`] and [`cluster`]: candidate generation and partition merge
//! - [`metrics`]: pairwise and cluster evaluation

pub mod block;
pub mod cascade;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod matching;
pub mod metrics;
pub mod oracle;
pub mod similarity;
pub mod types;

pub use crate::cascade::{Cascade, CascadeReport, CascadeResult};
pub use crate::cluster::{ClusterOutput, Consolidator};
pub use crate::config::ResolveConfig;
pub use crate::error::{MatchError, ResolveError, ResolveResult};
pub use crate::executor::{Executor, TaskOutcome};
pub use crate::oracle::{Oracle, OracleRegistry};
pub use crate::types::{Answer, Decision, Pair, Record, Stage, Usage};
