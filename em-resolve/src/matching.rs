//! Batched oracle invocation
//!
//! Splits pairs into oracle batches, runs them through the executor and
//! returns one decision per pair in input order. Each batch records an
//! `oracle` telemetry span.

use crate::config::StageConfig;
use crate::error::{MatchError, ResolveError, ResolveResult};
use crate::executor::Executor;
use crate::oracle::Oracle;
use crate::types::{Decision, Pair, Usage};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Decisions of one stage with the executor's attempt accounting
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutput {
    /// One decision per pair, in input order
    pub decisions: Vec<Decision>,
    /// Oracle batches submitted
    pub batches: usize,
    /// Attempts over all batches, retries included
    pub attempts: u32,
}

impl MatchOutput {
    fn empty() -> Self {
        Self {
            decisions: Vec::new(),
            batches: 0,
            attempts: 0,
        }
    }

    /// Attempts beyond the first for each batch
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(self.batches as u32)
    }
}

/// Reject malformed pairs before any oracle call
pub fn validate_pairs(pairs: &[Pair]) -> ResolveResult<()> {
    for (index, pair) in pairs.iter().enumerate() {
        pair.validate()
            .map_err(|reason| ResolveError::Validation { index, reason })?;
    }
    Ok(())
}

/// Decide `pairs` with `oracle`
///
/// `stage` labels errors, logs and telemetry. The first failing batch
/// aborts the run; the error carries the index of that batch's first pair.
pub async fn match_pairs(
    executor: &Executor,
    oracle: &Arc<dyn Oracle>,
    pairs: &[Pair],
    config: &StageConfig,
    stage: &str,
) -> ResolveResult<MatchOutput> {
    if pairs.is_empty() {
        return Ok(MatchOutput::empty());
    }

    let batch_size = config.batch_size.max(1);
    if config.confidence && !oracle.supports_confidence() {
        tracing::warn!(
            stage,
            oracle = oracle.name(),
            "Oracle does not report confidence; its decisions are unscored"
        );
    }

    let telemetry = executor.telemetry().cloned();
    let keep_confidence = config.confidence;

    let tasks: Vec<_> = pairs
        .chunks(batch_size)
        .map(|batch| {
            let oracle = Arc::clone(oracle);
            let telemetry = telemetry.clone();
            move || {
                let oracle = Arc::clone(&oracle);
                let telemetry = telemetry.clone();
                async move {
                    let started = Instant::now();
                    let mut decisions = oracle.invoke(batch).await?;
                    let elapsed = started.elapsed();

                    if decisions.len() != batch.len() {
                        return Err(MatchError::Validation(format!(
                            "oracle '{}' returned {} decisions for {} pairs",
                            oracle.name(),
                            decisions.len(),
                            batch.len()
                        )));
                    }
                    for decision in &mut decisions {
                        decision.validate().map_err(MatchError::Validation)?;
                        if decision.latency.is_zero() {
                            decision.latency = elapsed;
                        }
                        if !keep_confidence {
                            decision.confidence = None;
                        }
                    }

                    if let Some(telemetry) = &telemetry {
                        let usage: Usage = decisions.iter().map(|d| &d.usage).sum();
                        telemetry.record(
                            "oracle",
                            json!({
                                "stage": stage,
                                "oracle": oracle.name(),
                                "pairs": batch.len(),
                                "latency": elapsed.as_secs_f64(),
                                "calls": usage.calls,
                                "input_units": usage.input_units,
                                "output_units": usage.output_units,
                            }),
                        );
                    }
                    Ok(decisions)
                }
            }
        })
        .collect();

    let num_batches = tasks.len();
    tracing::debug!(
        stage,
        oracle = oracle.name(),
        pairs = pairs.len(),
        batches = num_batches,
        "Submitting oracle batches"
    );

    let outcomes = executor
        .try_run(tasks)
        .await
        .map_err(|failure| ResolveError::Stage {
            stage: stage.to_string(),
            pair_index: failure.index * batch_size,
            source: failure.error,
        })?;

    let attempts = outcomes.iter().map(|outcome| outcome.attempts).sum();
    Ok(MatchOutput {
        decisions: outcomes.into_iter().flat_map(|outcome| outcome.value).collect(),
        batches: num_batches,
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorSettings, RetryPolicy};
    use crate::oracle::FixedOracle;
    use crate::types::Answer;
    use em_common::Telemetry;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ShortOracle;

    #[async_trait::async_trait]
    impl Oracle for ShortOracle {
        fn name(&self) -> &str {
            "short"
        }

        async fn invoke(&self, _pairs: &[Pair]) -> Result<Vec<Decision>, MatchError> {
            Ok(vec![Decision::yes()])
        }
    }

    /// Times out on its first call only
    #[derive(Default)]
    struct SlowOnceOracle {
        timed_out: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Oracle for SlowOnceOracle {
        fn name(&self) -> &str {
            "slow-once"
        }

        async fn invoke(&self, pairs: &[Pair]) -> Result<Vec<Decision>, MatchError> {
            if !self.timed_out.swap(true, Ordering::SeqCst) {
                return Err(MatchError::Timeout("first call".into()));
            }
            Ok(pairs.iter().map(|_| Decision::no()).collect())
        }
    }

    fn executor() -> Executor {
        Executor::new(ExecutorSettings {
            max_concurrency: 2,
            requests_per_minute: None,
            retry: RetryPolicy::immediate(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_batches_preserve_order_and_record_spans() {
        let telemetry = Telemetry::new();
        let executor = executor().with_telemetry(telemetry.clone());
        let oracle: Arc<dyn Oracle> = Arc::new(FixedOracle::yes());
        let pairs: Vec<Pair> = (0..5).map(|i| Pair::new(format!("a{}", i), "b")).collect();
        let config = StageConfig {
            batch_size: 2,
            ..StageConfig::with_oracle("fixed-yes")
        };

        let output = match_pairs(&executor, &oracle, &pairs, &config, "prematch")
            .await
            .unwrap();
        assert_eq!(output.decisions.len(), 5);
        assert!(output.decisions.iter().all(|d| d.answer == Answer::Yes));
        assert_eq!(output.batches, 3);
        assert_eq!(output.attempts, 3);
        assert_eq!(output.retries(), 0);

        let report = telemetry.report();
        assert_eq!(report.stats["oracle.calls"].count, 3);
        assert_eq!(report.sum("oracle.calls"), 5.0);
    }

    #[tokio::test]
    async fn test_decision_count_mismatch_is_validation_error() {
        let executor = executor();
        let oracle: Arc<dyn Oracle> = Arc::new(ShortOracle);
        let pairs = vec![Pair::new("a", "b"), Pair::new("c", "d")];
        let config = StageConfig {
            batch_size: 2,
            ..StageConfig::with_oracle("short")
        };

        let err = match_pairs(&executor, &oracle, &pairs, &config, "match")
            .await
            .unwrap_err();
        match err {
            ResolveError::Stage {
                stage,
                pair_index,
                source: MatchError::Validation(_),
            } => {
                assert_eq!(stage, "match");
                assert_eq!(pair_index, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_confidence_dropped_when_disabled() {
        let executor = executor();
        let oracle: Arc<dyn Oracle> = Arc::new(FixedOracle::yes());
        let config = StageConfig {
            confidence: false,
            ..StageConfig::with_oracle("fixed-yes")
        };
        let output = match_pairs(&executor, &oracle, &[Pair::new("a", "b")], &config, "prematch")
            .await
            .unwrap();
        assert_eq!(output.decisions[0].confidence, None);
    }

    #[tokio::test]
    async fn test_attempts_include_timeout_retries() {
        let executor = executor();
        let oracle: Arc<dyn Oracle> = Arc::new(SlowOnceOracle::default());
        let pairs = vec![Pair::new("a", "b"), Pair::new("c", "d")];

        let output = match_pairs(&executor, &oracle, &pairs, &StageConfig::with_oracle("slow-once"), "match")
            .await
            .unwrap();

        assert_eq!(output.decisions.len(), 2);
        assert_eq!(output.batches, 2);
        assert_eq!(output.attempts, 3);
        assert_eq!(output.retries(), 1);
    }

    #[test]
    fn test_validate_pairs_reports_index() {
        let pairs = vec![Pair::new("a", "b"), Pair::new("", "b")];
        match validate_pairs(&pairs) {
            Err(ResolveError::Validation { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
