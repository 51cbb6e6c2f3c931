//! Temperature scaling for oracle confidences
//!
//! Confidences are mapped to logits, divided by a temperature `T`, and
//! mapped back through the sigmoid. `T` is chosen in [0.1, 10] to minimize
//! binary log-loss against the labels. The transform is strictly monotonic,
//! so the ranking of confidences (and every answer) is unchanged.

use serde::{Deserialize, Serialize};

/// Lower temperature bound
pub const MIN_TEMPERATURE: f64 = 0.1;
/// Upper temperature bound
pub const MAX_TEMPERATURE: f64 = 10.0;

const EPSILON: f64 = 1e-15;
const GOLDEN: f64 = 0.618_033_988_749_894_9;
const MAX_ITERATIONS: usize = 200;
const TOLERANCE: f64 = 1e-8;

/// Fitted temperature and the rescaled confidences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub temperature: f64,
    /// One entry per input confidence, same order
    pub calibrated: Vec<f64>,
}

impl Calibration {
    fn identity(confidences: &[f64]) -> Self {
        Self {
            temperature: 1.0,
            calibrated: confidences.to_vec(),
        }
    }
}

fn logit(p: f64) -> f64 {
    let p = p.clamp(EPSILON, 1.0 - EPSILON);
    (p / (1.0 - p)).ln()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Mean binary cross-entropy of `probs` against `labels`
pub fn log_loss(probs: &[f64], labels: &[bool]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let total: f64 = probs
        .iter()
        .zip(labels)
        .map(|(&p, &y)| {
            let p = p.clamp(EPSILON, 1.0 - EPSILON);
            if y {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / probs.len() as f64
}

fn scaled(logits: &[f64], temperature: f64) -> Vec<f64> {
    logits.iter().map(|&z| sigmoid(z / temperature)).collect()
}

/// Fit a temperature and rescale `confidences`
///
/// Returns the identity (T = 1, confidences unchanged) when there are no
/// confidences or the labels contain a single class. The fitted loss never
/// exceeds the loss at T = 1.
pub fn temperature_scale(confidences: &[f64], labels: &[bool]) -> Calibration {
    let n = confidences.len().min(labels.len());
    if n == 0 {
        return Calibration::identity(confidences);
    }
    let labels = &labels[..n];
    let positives = labels.iter().filter(|&&y| y).count();
    if positives == 0 || positives == n {
        tracing::debug!(samples = n, "Single label class, skipping calibration");
        return Calibration::identity(confidences);
    }

    let logits: Vec<f64> = confidences[..n].iter().map(|&p| logit(p)).collect();
    let loss = |t: f64| log_loss(&scaled(&logits, t), labels);

    // Golden-section search over the bounded interval
    let (mut a, mut b) = (MIN_TEMPERATURE, MAX_TEMPERATURE);
    let mut c = b - GOLDEN * (b - a);
    let mut d = a + GOLDEN * (b - a);
    let (mut fc, mut fd) = (loss(c), loss(d));
    for _ in 0..MAX_ITERATIONS {
        if (b - a).abs() < TOLERANCE {
            break;
        }
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - GOLDEN * (b - a);
            fc = loss(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + GOLDEN * (b - a);
            fd = loss(d);
        }
    }

    let mut temperature = (a + b) / 2.0;
    // Boundary candidates catch minima at the interval edges
    for candidate in [MIN_TEMPERATURE, MAX_TEMPERATURE] {
        if loss(candidate) < loss(temperature) {
            temperature = candidate;
        }
    }
    if loss(1.0) <= loss(temperature) {
        return Calibration::identity(confidences);
    }

    tracing::debug!(samples = n, temperature, "Temperature scaling fitted");
    let mut calibrated = scaled(&logits, temperature);
    calibrated.extend_from_slice(&confidences[n..]);
    Calibration {
        temperature,
        calibrated,
    }
}
