//! Core types for entity resolution
//!
//! Records, candidate pairs, oracle answers and decisions shared by the
//! executor, cascade and clustering layers.
//!
//! # Architecture
//! - [`Record`]: opaque entity description (text or structured fields)
//! - [`RecordDigest`]: content identity used by clustering
//! - [`Pair`]: two records plus an optional ground-truth label
//! - [`Decision`]: an oracle's verdict with confidence, usage and latency

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::Duration;

// ============================================================================
// Records
// ============================================================================

/// Entity description submitted for matching
///
/// Serialized untagged: a JSON string is a text record, a JSON object is a
/// field record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    /// Free-form text
    Text(String),
    /// Named fields (sorted by name)
    Fields(BTreeMap<String, serde_json::Value>),
}

impl Record {
    /// Build a field record from `(name, value)` pairs
    pub fn fields<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        Record::Fields(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Canonical byte form used for digests
    ///
    /// Field records serialize with sorted keys, so two records with the same
    /// fields in a different insertion order share a digest.
    fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Record::Text(text) => {
                let mut bytes = b"text:".to_vec();
                bytes.extend_from_slice(text.as_bytes());
                bytes
            }
            Record::Fields(fields) => {
                let mut bytes = b"fields:".to_vec();
                // BTreeMap<String, Value> serialization cannot fail
                bytes.extend(serde_json::to_vec(fields).unwrap_or_default());
                bytes
            }
        }
    }

    /// SHA-256 content digest
    pub fn digest(&self) -> RecordDigest {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        let hash = hasher.finalize();
        RecordDigest(hash.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Flatten to text for similarity scoring, skipping `ignore_fields`
    ///
    /// Field values are joined in key order; string values are used verbatim,
    /// other values use their JSON form.
    pub fn to_text(&self, ignore_fields: &[String]) -> String {
        match self {
            Record::Text(text) => text.clone(),
            Record::Fields(fields) => fields
                .iter()
                .filter(|(name, _)| !ignore_fields.iter().any(|f| f == *name))
                .filter_map(|(_, value)| match value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Reject records with no content
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Record::Text(text) if text.trim().is_empty() => Err("empty text record".into()),
            Record::Fields(fields) if fields.is_empty() => Err("record has no fields".into()),
            _ => Ok(()),
        }
    }
}

impl From<&str> for Record {
    fn from(text: &str) -> Self {
        Record::Text(text.to_string())
    }
}

impl From<String> for Record {
    fn from(text: String) -> Self {
        Record::Text(text)
    }
}

/// Hex-encoded SHA-256 of a record's canonical form
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordDigest(String);

impl RecordDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Pairs
// ============================================================================

/// Candidate pair of records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub left: Record,
    pub right: Record,
    /// Ground truth (1 = same entity, 0 = different), if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<u8>,
}

impl Pair {
    pub fn new(left: impl Into<Record>, right: impl Into<Record>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            label: None,
        }
    }

    pub fn labeled(left: impl Into<Record>, right: impl Into<Record>, label: u8) -> Self {
        Self {
            label: Some(label),
            ..Self::new(left, right)
        }
    }

    /// Ground truth as a boolean
    pub fn truth(&self) -> Option<bool> {
        self.label.map(|l| l == 1)
    }

    /// Reject empty records and labels other than 0/1
    pub fn validate(&self) -> Result<(), String> {
        self.left.validate().map_err(|e| format!("left: {}", e))?;
        self.right.validate().map_err(|e| format!("right: {}", e))?;
        match self.label {
            None | Some(0) | Some(1) => Ok(()),
            Some(other) => Err(format!("label must be 0 or 1, got {}", other)),
        }
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Oracle verdict
///
/// Serializes as `"yes"`, `"no"`, or a bare number for score-style oracles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Answer {
    Yes,
    No,
    /// Match likelihood in [0, 1]
    #[serde(untagged)]
    Score(f64),
}

impl Answer {
    /// Whether the verdict counts as a match (scores at or above 0.5)
    pub fn is_yes(&self) -> bool {
        match self {
            Answer::Yes => true,
            Answer::No => false,
            Answer::Score(score) => *score >= 0.5,
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Yes => f.write_str("yes"),
            Answer::No => f.write_str("no"),
            Answer::Score(score) => write!(f, "{:.3}", score),
        }
    }
}

/// Resource usage of one or more oracle calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub calls: u64,
    /// Input units (tokens for model-backed oracles)
    pub input_units: u64,
    /// Output units
    pub output_units: u64,
}

impl Usage {
    pub fn new(calls: u64, input_units: u64, output_units: u64) -> Self {
        Self {
            calls,
            input_units,
            output_units,
        }
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            calls: self.calls + rhs.calls,
            input_units: self.input_units + rhs.input_units,
            output_units: self.output_units + rhs.output_units,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

impl Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Usage {
        iter.fold(Usage::default(), Add::add)
    }
}

impl<'a> Sum<&'a Usage> for Usage {
    fn sum<I: Iterator<Item = &'a Usage>>(iter: I) -> Usage {
        iter.copied().sum()
    }
}

/// Oracle decision for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub answer: Answer,
    /// Self-reported confidence in [0, 1]; `None` when the oracle gives none
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    /// Wall-clock latency of the call that produced this decision
    #[serde(with = "duration_secs", default)]
    pub latency: Duration,
}

impl Decision {
    pub fn new(answer: Answer) -> Self {
        Self {
            answer,
            confidence: None,
            explanation: None,
            usage: Usage::default(),
            latency: Duration::ZERO,
        }
    }

    pub fn yes() -> Self {
        Self::new(Answer::Yes)
    }

    pub fn no() -> Self {
        Self::new(Answer::No)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn is_yes(&self) -> bool {
        self.answer.is_yes()
    }

    /// Reject confidences outside [0, 1] and out-of-range scores
    pub fn validate(&self) -> Result<(), String> {
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(format!("confidence {} outside [0, 1]", c));
            }
        }
        if let Answer::Score(s) = self.answer {
            if !(0.0..=1.0).contains(&s) {
                return Err(format!("score {} outside [0, 1]", s));
            }
        }
        Ok(())
    }
}

/// Cascade stage that produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Cheap first-pass oracle
    Prematch,
    /// Expensive escalation oracle
    Match,
}

impl Stage {
    /// 1 for prematch, 2 for match
    pub fn number(&self) -> u8 {
        match self {
            Stage::Prematch => 1,
            Stage::Match => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prematch => "prematch",
            Stage::Match => "match",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serde helper: `Duration` as fractional seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
