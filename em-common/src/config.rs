//! Configuration file resolution and TOML loading

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "EM_CONFIG";

/// Logging section shared by every configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive ("info", "em_resolve=debug", ...)
    ///
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Include event targets in formatted output
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
        }
    }
}

/// Configuration file resolution following priority order:
/// 1. Explicit path argument (highest priority)
/// 2. Environment variable
/// 3. Per-user config directory (`<config_dir>/em/<file_name>`)
///
/// Returns `None` when no file exists, in which case callers fall back to
/// compiled defaults.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Option<PathBuf> {
    // Priority 1: explicit argument
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: user config directory
    let user_config = dirs::config_dir().map(|d| d.join("em").join(file_name));
    match user_config {
        Some(path) if path.exists() => Some(path),
        _ => None,
    }
}

/// Read and deserialize a TOML configuration file
///
/// A missing or unreadable file is an `Io` error; a malformed one is
/// `TomlParse`.
pub fn read_toml_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Read TOML failed");
        Error::Io(e)
    })?;
    parse_toml_config(&content)
}

/// Deserialize a TOML document held in memory
pub fn parse_toml_config<T: DeserializeOwned>(content: &str) -> Result<T> {
    Ok(toml::from_str(content)?)
}

/// Read an environment override, parsing it into `T`
///
/// Unset or blank variables yield `Ok(None)`; unparsable values are a
/// configuration error rather than being silently ignored.
pub fn env_override<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid value for {}: {} ({})", name, raw, e))),
        _ => Ok(None),
    }
}
