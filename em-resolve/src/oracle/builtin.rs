//! Local oracles that need no external service

use super::Oracle;
use crate::error::MatchError;
use crate::similarity::{token_set_ratio, tokens};
use crate::types::{Answer, Decision, Pair, Usage};
use std::time::Instant;

/// Answers every pair the same way
///
/// Used as a placeholder stage and in tests.
#[derive(Debug, Clone)]
pub struct FixedOracle {
    name: String,
    answer: Answer,
    confidence: Option<f64>,
}

impl FixedOracle {
    pub fn new(name: impl Into<String>, answer: Answer, confidence: Option<f64>) -> Self {
        Self {
            name: name.into(),
            answer,
            confidence,
        }
    }

    pub fn yes() -> Self {
        Self::new("fixed-yes", Answer::Yes, Some(1.0))
    }

    pub fn no() -> Self {
        Self::new("fixed-no", Answer::No, Some(1.0))
    }
}

#[async_trait::async_trait]
impl Oracle for FixedOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_confidence(&self) -> bool {
        self.confidence.is_some()
    }

    async fn invoke(&self, pairs: &[Pair]) -> Result<Vec<Decision>, MatchError> {
        Ok(pairs
            .iter()
            .map(|_| Decision {
                answer: self.answer,
                confidence: self.confidence,
                explanation: None,
                usage: Usage::new(1, 0, 0),
                latency: Default::default(),
            })
            .collect())
    }
}

/// Token-set similarity oracle
///
/// Answers yes when the similarity of the flattened records reaches
/// `threshold` (0-100). Confidence grows with the distance from the
/// threshold, so borderline pairs are the ones a cascade escalates.
#[derive(Debug, Clone)]
pub struct SimilarityOracle {
    threshold: f64,
    ignore_fields: Vec<String>,
}

impl Default for SimilarityOracle {
    fn default() -> Self {
        Self::new(60.0, vec!["id".to_string(), "uuid".to_string()])
    }
}

impl SimilarityOracle {
    pub fn new(threshold: f64, ignore_fields: Vec<String>) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 100.0),
            ignore_fields,
        }
    }

    fn decide(&self, pair: &Pair) -> Decision {
        let left = pair.left.to_text(&self.ignore_fields);
        let right = pair.right.to_text(&self.ignore_fields);
        let score = token_set_ratio(&left, &right);

        let is_match = score >= self.threshold;
        // Distance from the threshold relative to the room on that side
        let room = if is_match {
            100.0 - self.threshold
        } else {
            self.threshold
        };
        let confidence = if room > 0.0 {
            ((score - self.threshold).abs() / room).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let input_units = (tokens(&left).len() + tokens(&right).len()) as u64;
        Decision {
            answer: if is_match { Answer::Yes } else { Answer::No },
            confidence: Some(confidence),
            explanation: Some(format!("token-set similarity {:.0}", score)),
            usage: Usage::new(1, input_units, 1),
            latency: Default::default(),
        }
    }
}

#[async_trait::async_trait]
impl Oracle for SimilarityOracle {
    fn name(&self) -> &str {
        "similarity"
    }

    async fn invoke(&self, pairs: &[Pair]) -> Result<Vec<Decision>, MatchError> {
        let started = Instant::now();
        let mut decisions: Vec<Decision> = pairs.iter().map(|p| self.decide(p)).collect();
        let latency = started.elapsed();
        for decision in &mut decisions {
            decision.latency = latency;
        }
        Ok(decisions)
    }
}
