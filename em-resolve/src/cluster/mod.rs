//! Clustering consolidator
//!
//! Turns pairwise match decisions over candidate pairs into a partition of
//! records. Also provides the record-level operations built on it:
//! deduplication of one source and linkage of two sources.
//!
//! # Architecture
//! 1. Index records by content digest (duplicates share a slot)
//! 2. Generate candidate pairs with a [`Block`]
//! 3. Decide pairs with the configured oracle (via the executor)
//! 4. Merge decisions in pair order ([`merge::consolidate`])
//!
//! The consolidator records a `cluster` telemetry span per run but never
//! opens or closes telemetry epochs; callers own the epoch.

pub mod merge;

pub use merge::{Partition, TransitivityViolation};

use crate::block::{Block, SimilarityBlock};
use crate::config::{ResolveConfig, StageConfig};
use crate::error::{ResolveError, ResolveResult};
use crate::executor::Executor;
use crate::matching::match_pairs;
use crate::oracle::{Oracle, OracleRegistry};
use crate::types::{Decision, Pair, Record, RecordDigest, Usage};
use chrono::Utc;
use em_common::events::{EventBus, ResolveEvent};
use em_common::Telemetry;
use merge::Edge;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const STAGE: &str = "cluster";

/// Record with its assigned cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub cluster_id: usize,
    pub record: Record,
}

/// Record from one of several sources with its assigned cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedRecord {
    pub cluster_id: usize,
    /// Index of the source the record came from
    pub source: usize,
    pub record: Record,
}

/// Clustering result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterOutput {
    /// One entry per input record, in input order
    pub assignments: Vec<ClusterAssignment>,
    pub num_clusters: usize,
    pub violations: Vec<TransitivityViolation>,
    /// Candidate pairs decided
    pub pairs_considered: usize,
    /// Candidate pairs decided "yes"
    pub matches: usize,
    pub usage: Usage,
    /// Oracle calls attempted, timeout retries included; 0 when no oracle ran
    pub attempts: u32,
}

impl ClusterOutput {
    /// Cluster id per record, in input order
    pub fn cluster_ids(&self) -> Vec<usize> {
        self.assignments.iter().map(|a| a.cluster_id).collect()
    }

    /// Number of records in each cluster, indexed by cluster id
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_clusters];
        for assignment in &self.assignments {
            sizes[assignment.cluster_id] += 1;
        }
        sizes
    }

    /// Mean cluster size; 0 with no records
    pub fn avg_cluster_size(&self) -> f64 {
        if self.num_clusters == 0 {
            0.0
        } else {
            self.assignments.len() as f64 / self.num_clusters as f64
        }
    }
}

/// Slot of every record: index of the first record with the same digest
fn record_slots(records: &[Record]) -> (Vec<usize>, HashMap<RecordDigest, usize>) {
    let mut index: HashMap<RecordDigest, usize> = HashMap::with_capacity(records.len());
    let slots = records
        .iter()
        .enumerate()
        .map(|(i, record)| *index.entry(record.digest()).or_insert(i))
        .collect();
    (slots, index)
}

/// Resolve candidate pairs to record slots
///
/// A pair naming a record outside `records` is a validation error.
fn pair_slots(
    pairs: &[(Record, Record)],
    index: &HashMap<RecordDigest, usize>,
) -> ResolveResult<Vec<(usize, usize)>> {
    pairs
        .iter()
        .enumerate()
        .map(|(pair_index, (left, right))| {
            let lookup = |record: &Record, side: &str| {
                index
                    .get(&record.digest())
                    .copied()
                    .ok_or_else(|| ResolveError::Validation {
                        index: pair_index,
                        reason: format!("{} record is not among the input records", side),
                    })
            };
            Ok((lookup(left, "left")?, lookup(right, "right")?))
        })
        .collect()
}

/// Merge already-made decisions into clusters
///
/// `decisions[i]` decides `pairs[i]`. Pure and deterministic: the same
/// inputs always yield the same output.
pub fn assign_clusters(
    records: &[Record],
    pairs: &[(Record, Record)],
    decisions: &[Decision],
) -> ResolveResult<ClusterOutput> {
    if decisions.len() != pairs.len() {
        return Err(ResolveError::Validation {
            index: decisions.len().min(pairs.len()),
            reason: format!(
                "{} decisions for {} candidate pairs",
                decisions.len(),
                pairs.len()
            ),
        });
    }

    let (slots, index) = record_slots(records);
    let endpoints = pair_slots(pairs, &index)?;
    let edges: Vec<Edge> = endpoints
        .iter()
        .zip(decisions)
        .enumerate()
        .map(|(pair_index, (&(left, right), decision))| Edge {
            pair_index,
            left,
            right,
            is_match: decision.is_yes(),
        })
        .collect();

    let partition = merge::consolidate(&slots, &edges);
    let assignments = records
        .iter()
        .zip(&partition.cluster_ids)
        .map(|(record, &cluster_id)| ClusterAssignment {
            cluster_id,
            record: record.clone(),
        })
        .collect();

    Ok(ClusterOutput {
        assignments,
        num_clusters: partition.num_clusters,
        violations: partition.violations,
        pairs_considered: pairs.len(),
        matches: edges.iter().filter(|e| e.is_match).count(),
        usage: decisions.iter().map(|d| &d.usage).sum(),
        attempts: 0,
    })
}

/// Oracle-driven clustering
pub struct Consolidator {
    executor: Executor,
    oracle: Arc<dyn Oracle>,
    block: Arc<dyn Block>,
    stage: StageConfig,
    telemetry: Telemetry,
    events: Option<EventBus>,
}

impl Consolidator {
    pub fn new(
        executor: Executor,
        oracle: Arc<dyn Oracle>,
        block: Arc<dyn Block>,
        stage: StageConfig,
    ) -> ResolveResult<Self> {
        stage.validate("cluster.match")?;
        let telemetry = executor.telemetry().cloned().unwrap_or_default();
        telemetry.register("cluster.violations");
        telemetry.register("cluster.clusters");
        let events = executor.events().cloned();
        let executor = executor.with_telemetry(telemetry.clone());
        Ok(Self {
            executor,
            oracle,
            block,
            stage,
            telemetry,
            events,
        })
    }

    /// Build from configuration with a similarity block
    ///
    /// The consolidator gets its own executor and request budget; use
    /// [`Consolidator::from_config_with_executor`] to share one.
    pub fn from_config(config: &ResolveConfig, registry: &OracleRegistry) -> ResolveResult<Self> {
        let executor = Executor::new(config.executor.clone())?;
        Self::from_config_with_executor(config, registry, executor)
    }

    /// Build from configuration on an existing executor
    pub fn from_config_with_executor(
        config: &ResolveConfig,
        registry: &OracleRegistry,
        executor: Executor,
    ) -> ResolveResult<Self> {
        let oracle = registry.resolve(&config.cluster.stage.oracle)?;
        Self::new(
            executor,
            oracle,
            Arc::new(SimilarityBlock::new(config.block.clone())),
            config.cluster.stage.clone(),
        )
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.executor = self.executor.with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Cluster the records of a single source
    pub async fn cluster(&self, records: &[Record]) -> ResolveResult<ClusterOutput> {
        self.cluster_sources(&[records]).await
    }

    /// Cluster records drawn from several sources
    ///
    /// Two sources are blocked as cross pairs only; any other number of
    /// sources is blocked as one flattened source. Assignments follow
    /// source order, then record order.
    pub async fn cluster_sources(&self, sources: &[&[Record]]) -> ResolveResult<ClusterOutput> {
        let pairs = match sources {
            [left, right] => self.block.candidates(left, Some(*right)),
            [single] => self.block.candidates(single, None),
            _ => self.block.candidates(&sources.concat(), None),
        };
        let records = sources.concat();
        self.cluster_pairs(&records, &pairs).await
    }

    /// Decide explicit candidate pairs and merge them into clusters
    ///
    /// Pairs are validated against `records` before any oracle call.
    pub async fn cluster_pairs(
        &self,
        records: &[Record],
        pairs: &[(Record, Record)],
    ) -> ResolveResult<ClusterOutput> {
        for (index, record) in records.iter().enumerate() {
            record
                .validate()
                .map_err(|reason| ResolveError::Validation { index, reason })?;
        }
        let (_, digest_index) = record_slots(records);
        pair_slots(pairs, &digest_index)?;

        if let Some(events) = &self.events {
            events.emit_lossy(ResolveEvent::StageStarted {
                stage: STAGE.to_string(),
                pairs: pairs.len(),
                timestamp: Utc::now(),
            });
        }
        let started = Instant::now();

        let oracle_pairs: Vec<Pair> = pairs
            .iter()
            .map(|(left, right)| Pair::new(left.clone(), right.clone()))
            .collect();
        let decided =
            match_pairs(&self.executor, &self.oracle, &oracle_pairs, &self.stage, STAGE).await?;

        let mut output = assign_clusters(records, pairs, &decided.decisions)?;
        output.attempts = decided.attempts;

        for violation in &output.violations {
            tracing::warn!(
                pair_index = violation.pair_index,
                cluster_id = violation.cluster_id,
                left = violation.left,
                right = violation.right,
                "Transitivity violation: records already clustered together were judged different"
            );
            if let Some(events) = &self.events {
                events.emit_lossy(ResolveEvent::TransitivityViolation {
                    pair_index: violation.pair_index,
                    cluster_id: violation.cluster_id,
                });
            }
        }

        let elapsed = started.elapsed();
        self.telemetry.record(
            "cluster",
            json!({
                "records": records.len(),
                "pairs": pairs.len(),
                "matches": output.matches,
                "clusters": output.num_clusters,
                "violations": output.violations.len(),
                "attempts": output.attempts,
                "latency": elapsed.as_secs_f64(),
            }),
        );
        if let Some(events) = &self.events {
            events.emit_lossy(ResolveEvent::StageCompleted {
                stage: STAGE.to_string(),
                pairs: pairs.len(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        tracing::info!(
            records = records.len(),
            pairs = pairs.len(),
            clusters = output.num_clusters,
            violations = output.violations.len(),
            "Clustering completed"
        );

        Ok(output)
    }

    /// Keep the first record of every cluster, in input order
    pub async fn dedupe(&self, records: &[Record]) -> ResolveResult<Vec<Record>> {
        let output = self.cluster(records).await?;
        let mut seen = vec![false; output.num_clusters];
        Ok(output
            .assignments
            .into_iter()
            .filter(|a| !std::mem::replace(&mut seen[a.cluster_id], true))
            .map(|a| a.record)
            .collect())
    }

    /// Cluster two sources against each other
    pub async fn link(&self, left: &[Record], right: &[Record]) -> ResolveResult<Vec<LinkedRecord>> {
        let output = self.cluster_sources(&[left, right]).await?;
        let sources = std::iter::repeat(0)
            .take(left.len())
            .chain(std::iter::repeat(1).take(right.len()));
        Ok(output
            .assignments
            .into_iter()
            .zip(sources)
            .map(|(a, source)| LinkedRecord {
                cluster_id: a.cluster_id,
                source,
                record: a.record,
            })
            .collect())
    }
}
