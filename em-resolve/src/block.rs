//! Candidate pair generation (blocking)
//!
//! Blocking narrows the quadratic set of record pairs down to the ones worth
//! asking an oracle about. With one source, every unordered pair `(i, j)`
//! with `i < j` is considered once; with two sources, every cross pair.

use crate::config::BlockSettings;
use crate::similarity::token_set_ratio;
use crate::types::Record;

/// Candidate pair generator
pub trait Block: Send + Sync {
    /// Candidate pairs in deterministic order
    ///
    /// With `right = None` pairs are drawn from `left` alone.
    fn candidates(&self, left: &[Record], right: Option<&[Record]>) -> Vec<(Record, Record)>;
}

/// Keeps pairs whose token-set similarity reaches a threshold
#[derive(Debug, Clone)]
pub struct SimilarityBlock {
    settings: BlockSettings,
}

impl SimilarityBlock {
    pub fn new(settings: BlockSettings) -> Self {
        Self { settings }
    }

    fn keep(&self, a: &str, b: &str) -> bool {
        token_set_ratio(a, b) >= self.settings.similarity
    }
}

impl Default for SimilarityBlock {
    fn default() -> Self {
        Self::new(BlockSettings::default())
    }
}

impl Block for SimilarityBlock {
    fn candidates(&self, left: &[Record], right: Option<&[Record]>) -> Vec<(Record, Record)> {
        let ignore = &self.settings.ignore_fields;
        let left_text: Vec<String> = left.iter().map(|r| r.to_text(ignore)).collect();
        let mut pairs = Vec::new();

        match right {
            None => {
                for i in 0..left.len() {
                    for j in (i + 1)..left.len() {
                        if self.keep(&left_text[i], &left_text[j]) {
                            pairs.push((left[i].clone(), left[j].clone()));
                        }
                    }
                }
            }
            Some(right) => {
                let right_text: Vec<String> = right.iter().map(|r| r.to_text(ignore)).collect();
                for (i, l) in left.iter().enumerate() {
                    for (j, r) in right.iter().enumerate() {
                        if self.keep(&left_text[i], &right_text[j]) {
                            pairs.push((l.clone(), r.clone()));
                        }
                    }
                }
            }
        }

        tracing::debug!(
            left = left.len(),
            right = right.map(|r| r.len()),
            candidates = pairs.len(),
            threshold = self.settings.similarity,
            "Blocking complete"
        );
        pairs
    }
}

/// Emits every pair (no pruning)
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPairsBlock;

impl Block for AllPairsBlock {
    fn candidates(&self, left: &[Record], right: Option<&[Record]>) -> Vec<(Record, Record)> {
        match right {
            None => left
                .iter()
                .enumerate()
                .flat_map(|(i, a)| left[i + 1..].iter().map(move |b| (a.clone(), b.clone())))
                .collect(),
            Some(right) => left
                .iter()
                .flat_map(|a| right.iter().map(move |b| (a.clone(), b.clone())))
                .collect(),
        }
    }
}
