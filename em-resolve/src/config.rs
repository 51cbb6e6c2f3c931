//! Configuration resolution for em-resolve
//!
//! Provides multi-tier configuration resolution with ENV → TOML → defaults
//! priority. The TOML file is located through [`em_common::config`]
//! (explicit path, then `EM_CONFIG`, then the user config directory).
//!
//! ```toml
//! [executor]
//! max_concurrency = 16
//! requests_per_minute = 600
//!
//! [executor.retry]
//! max_attempts = 3
//!
//! [cascade]
//! threshold = 0.2
//!
//! [cascade.prematch]
//! oracle = "similarity"
//! batch_size = 8
//! ```

use crate::error::{ResolveError, ResolveResult};
use crate::types::Usage;
use em_common::config::{
    env_override, read_toml_config, resolve_config_path, LoggingConfig, CONFIG_ENV_VAR,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default config file name under the user config directory
pub const CONFIG_FILE_NAME: &str = "resolve.toml";

/// Overrides `executor.max_concurrency`
pub const MAX_CONCURRENCY_ENV: &str = "EM_MAX_CONCURRENCY";
/// Overrides `executor.requests_per_minute`
pub const REQUESTS_PER_MINUTE_ENV: &str = "EM_REQUESTS_PER_MINUTE";
/// Overrides `cascade.threshold`
pub const CASCADE_THRESHOLD_ENV: &str = "EM_CASCADE_THRESHOLD";

// ============================================================================
// Top level
// ============================================================================

/// Complete resolution configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    pub logging: LoggingConfig,
    pub executor: ExecutorSettings,
    pub cascade: CascadeSettings,
    pub cluster: ClusterSettings,
    pub block: BlockSettings,
}

impl ResolveConfig {
    /// Load from the resolved TOML file (if any), apply environment
    /// overrides, and validate
    pub fn load(explicit: Option<&Path>) -> ResolveResult<Self> {
        let mut config = match resolve_config_path(explicit, CONFIG_ENV_VAR, CONFIG_FILE_NAME) {
            Some(path) => {
                info!(path = %path.display(), "Loading resolution config");
                read_toml_config::<ResolveConfig>(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                ResolveConfig::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from TOML text and validate (no environment overrides)
    pub fn from_toml_str(content: &str) -> ResolveResult<Self> {
        let config: ResolveConfig = em_common::config::parse_toml_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EM_*` environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) -> ResolveResult<()> {
        if let Some(max) = env_override::<usize>(MAX_CONCURRENCY_ENV)? {
            info!(max_concurrency = max, "Executor concurrency overridden from environment");
            self.executor.max_concurrency = max;
        }
        if let Some(rpm) = env_override::<u32>(REQUESTS_PER_MINUTE_ENV)? {
            info!(requests_per_minute = rpm, "Executor rate limit overridden from environment");
            self.executor.requests_per_minute = Some(rpm);
        }
        if let Some(threshold) = env_override::<f64>(CASCADE_THRESHOLD_ENV)? {
            info!(threshold, "Cascade threshold overridden from environment");
            self.cascade.threshold = threshold;
        }
        Ok(())
    }

    /// Check every section
    pub fn validate(&self) -> ResolveResult<()> {
        self.executor.validate()?;
        self.cascade.validate()?;
        self.cluster.stage.validate("cluster")?;
        self.block.validate()?;
        Ok(())
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Concurrency and rate limits for oracle calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Maximum tasks in flight at once
    pub max_concurrency: usize,
    /// Maximum task starts in any rolling 60 s window (unlimited if absent)
    pub requests_per_minute: Option<u32>,
    pub retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            requests_per_minute: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorSettings {
    pub fn validate(&self) -> ResolveResult<()> {
        if self.max_concurrency == 0 {
            return Err(ResolveError::Config(
                "executor.max_concurrency must be at least 1".into(),
            ));
        }
        if self.requests_per_minute == Some(0) {
            return Err(ResolveError::Config(
                "executor.requests_per_minute must be at least 1".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Timeout retry policy
///
/// **Backoff Strategy:**
/// - Initial delay: `initial_backoff_ms`
/// - Multiplier: 2.0 (exponential)
/// - Max delay: `max_backoff_ms`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per task, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Policy with no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> ResolveResult<()> {
        if self.max_attempts == 0 {
            return Err(ResolveError::Config(
                "executor.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ResolveError::Config(format!(
                "executor.retry.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Price per thousand usage units
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl CostModel {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Monetary cost of `usage`
    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.input_units as f64 / 1000.0 * self.input_per_1k
            + usage.output_units as f64 / 1000.0 * self.output_per_1k
    }
}

/// How one oracle stage is invoked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Registry name of the oracle
    pub oracle: String,
    /// Keep oracle confidences; when false every decision is unscored
    pub confidence: bool,
    /// Pairs per oracle invocation
    pub batch_size: usize,
    pub cost: CostModel,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            oracle: "similarity".to_string(),
            confidence: true,
            batch_size: 1,
            cost: CostModel::default(),
        }
    }
}

impl StageConfig {
    pub fn with_oracle(oracle: impl Into<String>) -> Self {
        Self {
            oracle: oracle.into(),
            ..Self::default()
        }
    }

    /// Apply per-call overrides
    ///
    /// Recognized keys: `oracle`, `confidence`, `batch_size`,
    /// `cost.input_per_1k`, `cost.output_per_1k`. Unknown keys and
    /// mistyped values are configuration errors.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, toml::Value>) -> ResolveResult<()> {
        for (key, value) in overrides {
            let mismatch = |expected: &str| {
                ResolveError::Config(format!(
                    "override '{}' expects {}, got {}",
                    key,
                    expected,
                    value.type_str()
                ))
            };
            match key.as_str() {
                "oracle" => {
                    self.oracle = value.as_str().ok_or_else(|| mismatch("a string"))?.to_string();
                }
                "confidence" => {
                    self.confidence = value.as_bool().ok_or_else(|| mismatch("a boolean"))?;
                }
                "batch_size" => {
                    let size = value.as_integer().ok_or_else(|| mismatch("an integer"))?;
                    self.batch_size =
                        usize::try_from(size).map_err(|_| mismatch("a non-negative integer"))?;
                }
                "cost.input_per_1k" => {
                    self.cost.input_per_1k = toml_number(value).ok_or_else(|| mismatch("a number"))?;
                }
                "cost.output_per_1k" => {
                    self.cost.output_per_1k = toml_number(value).ok_or_else(|| mismatch("a number"))?;
                }
                _ => {
                    return Err(ResolveError::Config(format!("unknown stage override '{}'", key)));
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self, section: &str) -> ResolveResult<()> {
        if self.oracle.trim().is_empty() {
            return Err(ResolveError::Config(format!("{}.oracle must be set", section)));
        }
        if self.batch_size == 0 {
            return Err(ResolveError::Config(format!(
                "{}.batch_size must be at least 1",
                section
            )));
        }
        if self.cost.input_per_1k < 0.0 || self.cost.output_per_1k < 0.0 {
            return Err(ResolveError::Config(format!(
                "{}.cost prices must be non-negative",
                section
            )));
        }
        Ok(())
    }
}

fn toml_number(value: &toml::Value) -> Option<f64> {
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}

/// Two-stage cascade settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeSettings {
    /// Minimum stage-1 confidence to accept without escalation
    pub threshold: f64,
    /// Fit temperature scaling on labeled results
    pub calibrate: bool,
    pub prematch: StageConfig,
    #[serde(rename = "match")]
    pub matcher: StageConfig,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            calibrate: true,
            prematch: StageConfig::with_oracle("similarity"),
            matcher: StageConfig::with_oracle("similarity"),
        }
    }
}

impl CascadeSettings {
    pub fn validate(&self) -> ResolveResult<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ResolveError::Config(format!(
                "cascade.threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        self.prematch.validate("cascade.prematch")?;
        self.matcher.validate("cascade.match")
    }
}

/// Clustering settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Oracle stage deciding candidate pairs
    #[serde(rename = "match")]
    pub stage: StageConfig,
}

/// Candidate-pair generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockSettings {
    /// Minimum token-set similarity (0-100) for a candidate pair
    pub similarity: f64,
    /// Fields excluded from similarity scoring
    pub ignore_fields: Vec<String>,
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            similarity: 60.0,
            ignore_fields: vec!["id".to_string(), "uuid".to_string()],
        }
    }
}

impl BlockSettings {
    pub fn validate(&self) -> ResolveResult<()> {
        if !(0.0..=100.0).contains(&self.similarity) {
            return Err(ResolveError::Config(format!(
                "block.similarity must be in [0, 100], got {}",
                self.similarity
            )));
        }
        Ok(())
    }
}
