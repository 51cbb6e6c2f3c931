//! Evaluation metrics
//!
//! Pairwise match quality (precision, recall, F1, accuracy), run-level
//! throughput, and cluster quality (adjusted Rand index, homogeneity,
//! completeness).
//!
//! Degenerate inputs never produce NaN:
//! - precision is 1.0 with no predicted and no true positives, else 0.0
//! - recall is 1.0 with no true and no predicted positives, else 0.0
//! - F1 is 0.0 when precision + recall is 0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Pairwise metrics
// ============================================================================

/// Binary confusion counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl ConfusionMatrix {
    /// Count outcomes of aligned truth/prediction vectors
    pub fn from_predictions(truth: &[bool], predictions: &[bool]) -> Self {
        let mut matrix = Self::default();
        for (&t, &p) in truth.iter().zip(predictions) {
            match (t, p) {
                (true, true) => matrix.tp += 1,
                (false, true) => matrix.fp += 1,
                (false, false) => matrix.tn += 1,
                (true, false) => matrix.fn_ += 1,
            }
        }
        matrix
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn precision(&self) -> f64 {
        let predicted = self.tp + self.fp;
        if predicted == 0 {
            return if self.tp + self.fn_ == 0 { 1.0 } else { 0.0 };
        }
        self.tp as f64 / predicted as f64
    }

    pub fn recall(&self) -> f64 {
        let actual = self.tp + self.fn_;
        if actual == 0 {
            return if self.tp + self.fp == 0 { 1.0 } else { 0.0 };
        }
        self.tp as f64 / actual as f64
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.tp + self.tn) as f64 / total as f64
    }
}

/// Pairwise quality summary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchMetrics {
    pub confusion: ConfusionMatrix,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
}

impl MatchMetrics {
    pub fn from_confusion(confusion: ConfusionMatrix) -> Self {
        Self {
            confusion,
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1: confusion.f1(),
            accuracy: confusion.accuracy(),
        }
    }
}

/// Score predictions against ground truth
///
/// Extra elements of the longer slice are ignored.
pub fn report(truth: &[bool], predictions: &[bool]) -> MatchMetrics {
    MatchMetrics::from_confusion(ConfusionMatrix::from_predictions(truth, predictions))
}

/// Score only the entries that carry a label; `None` when none do
pub fn report_labeled(labeled: impl IntoIterator<Item = (Option<bool>, bool)>) -> Option<MatchMetrics> {
    let (truth, predictions): (Vec<bool>, Vec<bool>) = labeled
        .into_iter()
        .filter_map(|(truth, prediction)| truth.map(|t| (t, prediction)))
        .unzip();
    if truth.is_empty() {
        None
    } else {
        Some(report(&truth, &predictions))
    }
}

/// Items per second; 0 for an empty or instantaneous run
pub fn throughput(items: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if items == 0 || secs <= 0.0 {
        0.0
    } else {
        items as f64 / secs
    }
}

/// Mean of present values; `None` when there are none
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

// ============================================================================
// Cluster metrics
// ============================================================================

/// Agreement between a predicted partition and ground truth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterScores {
    pub adjusted_rand_index: f64,
    pub homogeneity: f64,
    pub completeness: f64,
}

fn comb2(n: usize) -> f64 {
    let n = n as f64;
    n * (n - 1.0) / 2.0
}

fn entropy(counts: impl Iterator<Item = usize>, total: f64) -> f64 {
    counts
        .filter(|&c| c > 0)
        .map(|c| {
            let p = c as f64 / total;
            -p * p.ln()
        })
        .sum()
}

/// Compare cluster labelings (one label per record, same order)
///
/// Label values are arbitrary; only co-membership matters. Empty input
/// scores perfectly.
pub fn cluster_scores(truth: &[usize], predicted: &[usize]) -> ClusterScores {
    let n = truth.len().min(predicted.len());
    if n == 0 {
        return ClusterScores {
            adjusted_rand_index: 1.0,
            homogeneity: 1.0,
            completeness: 1.0,
        };
    }

    let mut contingency: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut class_sizes: BTreeMap<usize, usize> = BTreeMap::new();
    let mut cluster_sizes: BTreeMap<usize, usize> = BTreeMap::new();
    for (&c, &k) in truth.iter().zip(predicted).take(n) {
        *contingency.entry((c, k)).or_default() += 1;
        *class_sizes.entry(c).or_default() += 1;
        *cluster_sizes.entry(k).or_default() += 1;
    }

    // Adjusted Rand index
    let index: f64 = contingency.values().map(|&v| comb2(v)).sum();
    let sum_classes: f64 = class_sizes.values().map(|&v| comb2(v)).sum();
    let sum_clusters: f64 = cluster_sizes.values().map(|&v| comb2(v)).sum();
    let expected = sum_classes * sum_clusters / comb2(n).max(1.0);
    let max_index = (sum_classes + sum_clusters) / 2.0;
    let adjusted_rand_index = if (max_index - expected).abs() < f64::EPSILON {
        1.0
    } else {
        (index - expected) / (max_index - expected)
    };

    // Conditional entropies
    let total = n as f64;
    let h_class = entropy(class_sizes.values().copied(), total);
    let h_cluster = entropy(cluster_sizes.values().copied(), total);
    let mut h_class_given_cluster = 0.0;
    let mut h_cluster_given_class = 0.0;
    for (&(c, k), &count) in &contingency {
        let joint = count as f64 / total;
        h_class_given_cluster -= joint * (count as f64 / cluster_sizes[&k] as f64).ln();
        h_cluster_given_class -= joint * (count as f64 / class_sizes[&c] as f64).ln();
    }

    let homogeneity = if h_class == 0.0 {
        1.0
    } else {
        1.0 - h_class_given_cluster / h_class
    };
    let completeness = if h_cluster == 0.0 {
        1.0
    } else {
        1.0 - h_cluster_given_class / h_cluster
    };

    ClusterScores {
        adjusted_rand_index,
        homogeneity,
        completeness,
    }
}
