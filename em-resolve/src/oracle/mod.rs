//! Matching oracles
//!
//! An oracle decides whether the records of a pair refer to the same entity.
//! Oracles are opaque collaborators: a hosted model, a local similarity
//! function, or a scripted test double.
//!
//! # Architecture
//! - [`Oracle`]: async trait invoked with a batch of pairs
//! - [`OracleRegistry`]: name → oracle table, resolved once when a cascade
//!   or consolidator is constructed

pub mod builtin;

pub use builtin::{FixedOracle, SimilarityOracle};

use crate::error::{MatchError, ResolveError, ResolveResult};
use crate::types::{Decision, Pair};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Pair-matching oracle
///
/// # Example
/// ```rust,ignore
/// use em_resolve::oracle::Oracle;
///
/// pub struct ModelOracle { client: Client }
///
/// #[async_trait::async_trait]
/// impl Oracle for ModelOracle {
///     fn name(&self) -> &str { "model" }
///
///     async fn invoke(&self, pairs: &[Pair]) -> Result<Vec<Decision>, MatchError> {
///         let prompt = render(pairs);
///         let reply = self.client.complete(prompt).await?;
///         parse_decisions(&reply, pairs.len())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Oracle: Send + Sync {
    /// Oracle name for logging and telemetry
    fn name(&self) -> &str;

    /// Whether decisions carry a meaningful confidence
    ///
    /// Oracles without confidence support always escalate in a cascade.
    fn supports_confidence(&self) -> bool {
        true
    }

    /// Decide a batch of pairs
    ///
    /// Must return exactly one decision per input pair, in input order.
    /// Return `MatchError::Timeout` for deadline failures so the executor can
    /// retry; every other error aborts the batch.
    async fn invoke(&self, pairs: &[Pair]) -> Result<Vec<Decision>, MatchError>;
}

/// Registry of named oracles
#[derive(Clone, Default)]
pub struct OracleRegistry {
    oracles: BTreeMap<String, Arc<dyn Oracle>>,
}

impl std::fmt::Debug for OracleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl OracleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the local oracles:
    /// `similarity`, `fixed-yes`, `fixed-no`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("similarity", Arc::new(SimilarityOracle::default()));
        registry.register("fixed-yes", Arc::new(FixedOracle::yes()));
        registry.register("fixed-no", Arc::new(FixedOracle::no()));
        registry
    }

    /// Register (or replace) an oracle under `name`
    pub fn register(&mut self, name: impl Into<String>, oracle: Arc<dyn Oracle>) {
        let name = name.into();
        if self.oracles.insert(name.clone(), oracle).is_some() {
            tracing::debug!(oracle = %name, "Replaced registered oracle");
        }
    }

    /// Look up an oracle by name
    pub fn resolve(&self, name: &str) -> ResolveResult<Arc<dyn Oracle>> {
        self.oracles.get(name).cloned().ok_or_else(|| {
            ResolveError::Config(format!(
                "unknown oracle '{}' (registered: {})",
                name,
                self.names().join(", ")
            ))
        })
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.oracles.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = OracleRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["fixed-no", "fixed-yes", "similarity"]);
        assert_eq!(registry.resolve("similarity").unwrap().name(), "similarity");
    }

    #[test]
    fn test_unknown_oracle_is_config_error() {
        let registry = OracleRegistry::with_builtins();
        match registry.resolve("gpt") {
            Err(ResolveError::Config(msg)) => assert!(msg.contains("gpt")),
            other => panic!("expected config error, got {:?}", other.map(|o| o.name().to_string())),
        }
    }
}
