//! Two-stage confidence cascade
//!
//! Every pair is first decided by a cheap prematch oracle. Pairs whose
//! prematch confidence is missing or below the threshold are escalated to
//! the expensive match oracle; the rest keep their prematch decision.
//!
//! # Architecture
//! 1. Validate pairs (no oracle call on malformed input)
//! 2. Stage 1: all pairs → prematch oracle (via the executor)
//! 3. Route on stage-1 confidence
//! 4. Stage 2: escalated pairs → match oracle (skipped when none escalate)
//! 5. Merge in input order, calibrate per stage, compute report
//!
//! Any stage error aborts the run with the stage name and pair index.
//!
//! Each run writes spans to its own telemetry epoch, so overlapping runs on
//! one cascade never share statistics. Finished epochs, failed ones
//! included, are archived in the cascade's store history.

pub mod calibrate;

pub use calibrate::{temperature_scale, Calibration};

use crate::config::{CascadeSettings, ResolveConfig, StageConfig};
use crate::error::{MatchError, ResolveError, ResolveResult};
use crate::executor::Executor;
use crate::matching::{match_pairs, validate_pairs, MatchOutput};
use crate::metrics::{self, MatchMetrics};
use crate::oracle::{Oracle, OracleRegistry};
use crate::types::{Decision, Pair, Stage, Usage};
use chrono::Utc;
use em_common::events::{EventBus, ResolveEvent};
use em_common::{Telemetry, TelemetryReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Whether a stage-1 confidence sends the pair to stage 2
///
/// Missing confidence always escalates.
pub fn should_escalate(confidence: Option<f64>, threshold: f64) -> bool {
    match confidence {
        Some(c) => c < threshold,
        None => true,
    }
}

/// Final decision for one input pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeResult {
    /// Position in the input
    pub index: usize,
    pub pair: Pair,
    /// Stage whose decision is final
    pub stage: Stage,
    pub decision: Decision,
    /// Stage-1 confidence used for routing
    pub routing_confidence: Option<f64>,
    /// Temperature-scaled confidence, when calibration ran for this stage
    pub calibrated_confidence: Option<f64>,
}

/// Per-stage statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: Stage,
    pub oracle: String,
    /// Pairs submitted to the stage
    pub num_pairs: usize,
    pub usage: Usage,
    pub cost: f64,
    pub elapsed_secs: f64,
    /// Oracle calls attempted, timeout retries included
    pub attempts: u32,
    /// Attempts beyond the first for each oracle batch
    pub retries: u32,
    /// Quality of this stage's own decisions on labeled pairs
    pub metrics: Option<MatchMetrics>,
    /// Fitted temperature, when calibration ran
    pub temperature: Option<f64>,
}

/// Run-level statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStats {
    pub num_pairs: usize,
    /// Pairs decided by stage 2
    pub escalated: usize,
    pub threshold: f64,
    /// Final-decision quality on labeled pairs
    pub metrics: Option<MatchMetrics>,
    pub usage: Usage,
    /// Sum of both stage costs
    pub cost: f64,
    pub latency_secs: f64,
    /// Pairs per second
    pub throughput: f64,
    pub per_pair_latency_secs: f64,
    /// Mean of present final-decision confidences
    pub avg_confidence: Option<f64>,
}

/// Everything a cascade run produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeReport {
    /// One result per input pair, in input order
    pub results: Vec<CascadeResult>,
    pub stats: CascadeStats,
    pub prematch: StageStats,
    /// Absent when nothing escalated
    pub matcher: Option<StageStats>,
    pub telemetry: TelemetryReport,
}

impl CascadeReport {
    /// Final answers in input order
    pub fn predictions(&self) -> Vec<bool> {
        self.results.iter().map(|r| r.decision.is_yes()).collect()
    }

    /// Indices of escalated pairs
    pub fn escalated_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|r| r.stage == Stage::Match)
            .map(|r| r.index)
            .collect()
    }
}

/// Two-stage cascade over a pair of oracles
pub struct Cascade {
    executor: Executor,
    prematch: Arc<dyn Oracle>,
    matcher: Arc<dyn Oracle>,
    settings: CascadeSettings,
    telemetry: Telemetry,
    events: Option<EventBus>,
}

impl Cascade {
    /// Build a cascade from resolved oracles
    ///
    /// The executor's telemetry store is reused when present.
    pub fn new(
        executor: Executor,
        prematch: Arc<dyn Oracle>,
        matcher: Arc<dyn Oracle>,
        settings: CascadeSettings,
    ) -> ResolveResult<Self> {
        settings.validate()?;
        let telemetry = executor.telemetry().cloned().unwrap_or_default();
        let events = executor.events().cloned();
        let executor = executor.with_telemetry(telemetry.clone());
        Ok(Self {
            executor,
            prematch,
            matcher,
            settings,
            telemetry,
            events,
        })
    }

    /// Build a cascade from configuration, resolving oracle names once
    ///
    /// The cascade gets its own executor, and with it its own
    /// `requests_per_minute` budget.
    pub fn from_config(config: &ResolveConfig, registry: &OracleRegistry) -> ResolveResult<Self> {
        let executor = Executor::new(config.executor.clone())?;
        Self::from_config_with_executor(config, registry, executor)
    }

    /// Build from configuration on an existing executor
    ///
    /// Components built on clones of one executor share its rate limiter and
    /// cancellation token, so they draw on a single request budget.
    pub fn from_config_with_executor(
        config: &ResolveConfig,
        registry: &OracleRegistry,
        executor: Executor,
    ) -> ResolveResult<Self> {
        let prematch = registry.resolve(&config.cascade.prematch.oracle)?;
        let matcher = registry.resolve(&config.cascade.matcher.oracle)?;
        Self::new(executor, prematch, matcher, config.cascade.clone())
    }

    /// Emit stage events on `events` (also used by the executor)
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.executor = self.executor.with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &CascadeSettings {
        &self.settings
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Store holding the archived epoch of every finished run
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    async fn run_stage(
        &self,
        executor: &Executor,
        stage: Stage,
        oracle: &Arc<dyn Oracle>,
        config: &StageConfig,
        pairs: &[Pair],
    ) -> ResolveResult<(MatchOutput, Duration)> {
        if let Some(events) = &self.events {
            events.emit_lossy(ResolveEvent::StageStarted {
                stage: stage.to_string(),
                pairs: pairs.len(),
                timestamp: Utc::now(),
            });
        }
        tracing::info!(stage = %stage, oracle = oracle.name(), pairs = pairs.len(), "Cascade stage started");

        let started = Instant::now();
        let output = match_pairs(executor, oracle, pairs, config, stage.as_str()).await?;
        let elapsed = started.elapsed();

        if let Some(events) = &self.events {
            events.emit_lossy(ResolveEvent::StageCompleted {
                stage: stage.to_string(),
                pairs: pairs.len(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        tracing::info!(
            stage = %stage,
            pairs = pairs.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            attempts = output.attempts,
            "Cascade stage completed"
        );
        Ok((output, elapsed))
    }

    /// Run the cascade over `pairs`
    ///
    /// The report carries the statistics of this run's telemetry epoch only.
    pub async fn run(&self, pairs: &[Pair]) -> ResolveResult<CascadeReport> {
        validate_pairs(pairs)?;
        let telemetry = self.telemetry.fork();
        let executor = self.executor.clone().with_telemetry(telemetry.clone());

        let result = self.run_epoch(&executor, &telemetry, pairs).await;
        if let Err(err) = &result {
            let report = telemetry.stop();
            tracing::warn!(
                pairs = pairs.len(),
                spans = report.num_spans,
                retryable = err.match_error().map(MatchError::is_retryable),
                error = %err,
                "Cascade run failed"
            );
        }
        self.telemetry.archive(&telemetry);
        result
    }

    async fn run_epoch(
        &self,
        executor: &Executor,
        telemetry: &Telemetry,
        pairs: &[Pair],
    ) -> ResolveResult<CascadeReport> {
        let wall = Instant::now();
        let threshold = self.settings.threshold;

        // Stage 1: every pair
        let (stage1_output, stage1_elapsed) = self
            .run_stage(executor, Stage::Prematch, &self.prematch, &self.settings.prematch, pairs)
            .await?;
        let stage1 = &stage1_output.decisions;

        let escalated: Vec<usize> = stage1
            .iter()
            .enumerate()
            .filter(|(_, d)| should_escalate(d.confidence, threshold))
            .map(|(i, _)| i)
            .collect();
        tracing::info!(
            pairs = pairs.len(),
            escalated = escalated.len(),
            threshold,
            "Cascade routing complete"
        );

        // Stage 2: escalated pairs only
        let stage2 = if escalated.is_empty() {
            tracing::debug!("No pairs escalated, skipping match stage");
            None
        } else {
            let subset: Vec<Pair> = escalated.iter().map(|&i| pairs[i].clone()).collect();
            let (output, elapsed) = self
                .run_stage(executor, Stage::Match, &self.matcher, &self.settings.matcher, &subset)
                .await
                .map_err(|e| e.remap_pair_index(|i| escalated[i]))?;
            Some((output, elapsed))
        };

        // Merge in input order
        let mut results: Vec<CascadeResult> = stage1
            .iter()
            .enumerate()
            .map(|(index, decision)| CascadeResult {
                index,
                pair: pairs[index].clone(),
                stage: Stage::Prematch,
                decision: decision.clone(),
                routing_confidence: decision.confidence,
                calibrated_confidence: None,
            })
            .collect();
        if let Some((output, _)) = &stage2 {
            for (&index, decision) in escalated.iter().zip(&output.decisions) {
                results[index].stage = Stage::Match;
                results[index].decision = decision.clone();
            }
        }

        let mut temperatures = [None, None];
        if self.settings.calibrate {
            for (slot, stage) in [Stage::Prematch, Stage::Match].into_iter().enumerate() {
                temperatures[slot] = calibrate_stage(&mut results, stage);
            }
        }

        let latency = wall.elapsed();
        let telemetry = telemetry.stop();

        let prematch_stats = stage_stats(
            Stage::Prematch,
            self.prematch.name(),
            &self.settings.prematch,
            pairs.iter().zip(stage1),
            &stage1_output,
            stage1_elapsed,
            temperatures[0],
        );
        let match_stats = stage2.as_ref().map(|(output, elapsed)| {
            stage_stats(
                Stage::Match,
                self.matcher.name(),
                &self.settings.matcher,
                escalated.iter().map(|&i| &pairs[i]).zip(&output.decisions),
                output,
                *elapsed,
                temperatures[1],
            )
        });

        let usage = prematch_stats.usage + match_stats.as_ref().map(|s| s.usage).unwrap_or_default();
        let cost = prematch_stats.cost + match_stats.as_ref().map(|s| s.cost).unwrap_or(0.0);
        let num_pairs = pairs.len();

        let stats = CascadeStats {
            num_pairs,
            escalated: escalated.len(),
            threshold,
            metrics: metrics::report_labeled(
                results
                    .iter()
                    .map(|r| (r.pair.truth(), r.decision.is_yes())),
            ),
            usage,
            cost,
            latency_secs: latency.as_secs_f64(),
            throughput: metrics::throughput(num_pairs, latency),
            per_pair_latency_secs: if num_pairs == 0 {
                0.0
            } else {
                latency.as_secs_f64() / num_pairs as f64
            },
            avg_confidence: metrics::mean(results.iter().filter_map(|r| r.decision.confidence)),
        };

        tracing::info!(
            pairs = num_pairs,
            escalated = stats.escalated,
            cost = stats.cost,
            latency_ms = latency.as_millis() as u64,
            "Cascade run completed"
        );

        Ok(CascadeReport {
            results,
            stats,
            prematch: prematch_stats,
            matcher: match_stats,
            telemetry,
        })
    }
}

/// Calibrate the confidences of results decided by `stage`
///
/// Only labeled results with a confidence take part. Returns the fitted
/// temperature, or `None` when there was nothing to fit.
fn calibrate_stage(results: &mut [CascadeResult], stage: Stage) -> Option<f64> {
    let members: Vec<(usize, f64, bool)> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.stage == stage)
        .filter_map(|(slot, r)| Some((slot, r.decision.confidence?, r.pair.truth()?)))
        .collect();
    if members.is_empty() {
        return None;
    }

    let confidences: Vec<f64> = members.iter().map(|m| m.1).collect();
    let labels: Vec<bool> = members.iter().map(|m| m.2).collect();
    let calibration = temperature_scale(&confidences, &labels);
    for ((slot, _, _), calibrated) in members.iter().zip(&calibration.calibrated) {
        results[*slot].calibrated_confidence = Some(*calibrated);
    }
    tracing::debug!(stage = %stage, samples = members.len(), temperature = calibration.temperature, "Stage calibrated");
    Some(calibration.temperature)
}

fn stage_stats<'a>(
    stage: Stage,
    oracle: &str,
    config: &StageConfig,
    decided: impl Iterator<Item = (&'a Pair, &'a Decision)>,
    output: &MatchOutput,
    elapsed: Duration,
    temperature: Option<f64>,
) -> StageStats {
    let mut usage = Usage::default();
    let mut labeled = Vec::new();
    let mut num_pairs = 0;
    for (pair, decision) in decided {
        num_pairs += 1;
        usage += decision.usage;
        labeled.push((pair.truth(), decision.is_yes()));
    }
    StageStats {
        stage,
        oracle: oracle.to_string(),
        num_pairs,
        usage,
        cost: config.cost.cost(&usage),
        elapsed_secs: elapsed.as_secs_f64(),
        attempts: output.attempts,
        retries: output.retries(),
        metrics: metrics::report_labeled(labeled),
        temperature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_escalate() {
        assert!(should_escalate(None, 0.0));
        assert!(should_escalate(Some(0.1), 0.5));
        assert!(!should_escalate(Some(0.5), 0.5));
        assert!(!should_escalate(Some(0.9), 0.5));
        // Threshold 0 accepts every scored decision
        assert!(!should_escalate(Some(0.0), 0.0));
    }
}
