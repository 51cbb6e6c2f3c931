//! Integration tests for resolution configuration loading
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate EM_* variables are marked with #[serial] to ensure
//! they run sequentially, not in parallel.

use em_common::config::CONFIG_ENV_VAR;
use em_resolve::config::{
    ResolveConfig, CASCADE_THRESHOLD_ENV, MAX_CONCURRENCY_ENV, REQUESTS_PER_MINUTE_ENV,
};
use em_resolve::ResolveError;
use serial_test::serial;
use std::env;
use std::path::Path;
use tempfile::TempDir;

const SAMPLE: &str = r#"
[logging]
level = "em_resolve=debug"

[executor]
max_concurrency = 8

[executor.retry]
max_attempts = 5
initial_backoff_ms = 50
max_backoff_ms = 400

[cascade]
threshold = 0.3
calibrate = false

[cascade.prematch]
oracle = "similarity"
batch_size = 10

[cascade.match]
oracle = "fixed-yes"
cost = { input_per_1k = 0.5, output_per_1k = 1.5 }

[cluster.match]
oracle = "similarity"
batch_size = 4

[block]
similarity = 75
ignore_fields = ["sku"]
"#;

fn clear_overrides() {
    for var in [
        CONFIG_ENV_VAR,
        MAX_CONCURRENCY_ENV,
        REQUESTS_PER_MINUTE_ENV,
        CASCADE_THRESHOLD_ENV,
    ] {
        env::remove_var(var);
    }
}

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("resolve.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
#[serial]
fn test_load_explicit_file() {
    clear_overrides();
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, SAMPLE);

    let config = ResolveConfig::load(Some(&path)).unwrap();

    assert_eq!(config.logging.level, "em_resolve=debug");
    assert_eq!(config.executor.max_concurrency, 8);
    assert_eq!(config.executor.retry.max_attempts, 5);
    assert_eq!(config.cascade.threshold, 0.3);
    assert!(!config.cascade.calibrate);
    assert_eq!(config.cascade.prematch.batch_size, 10);
    assert_eq!(config.cascade.matcher.oracle, "fixed-yes");
    assert_eq!(config.cascade.matcher.cost.input_per_1k, 0.5);
    assert_eq!(config.cluster.stage.batch_size, 4);
    assert_eq!(config.block.similarity, 75.0);
    assert_eq!(config.block.ignore_fields, vec!["sku"]);
}

#[test]
#[serial]
fn test_env_var_locates_file_and_overrides_apply() {
    clear_overrides();
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, SAMPLE);

    env::set_var(CONFIG_ENV_VAR, &path);
    env::set_var(MAX_CONCURRENCY_ENV, "2");
    env::set_var(REQUESTS_PER_MINUTE_ENV, "90");
    env::set_var(CASCADE_THRESHOLD_ENV, "0.75");
    let config = ResolveConfig::load(None);
    clear_overrides();

    let config = config.unwrap();
    assert_eq!(config.executor.max_concurrency, 2);
    assert_eq!(config.executor.requests_per_minute, Some(90));
    assert_eq!(config.cascade.threshold, 0.75);
    // File values without overrides survive
    assert_eq!(config.executor.retry.max_attempts, 5);
}

#[test]
#[serial]
fn test_invalid_override_rejected() {
    clear_overrides();
    env::set_var(CASCADE_THRESHOLD_ENV, "2.5");
    let result = ResolveConfig::load(Some(Path::new("/nonexistent/resolve.toml")));
    clear_overrides();

    // Explicit missing file is reported before overrides apply
    assert!(matches!(
        result,
        Err(ResolveError::Common(em_common::Error::Io(_)))
    ));

    env::set_var(CASCADE_THRESHOLD_ENV, "2.5");
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, "");
    let result = ResolveConfig::load(Some(&path));
    clear_overrides();
    assert!(matches!(result, Err(ResolveError::Config(_))));
}

#[test]
#[serial]
fn test_malformed_toml_rejected() {
    clear_overrides();
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, "[executor\nmax_concurrency = 4");
    assert!(matches!(
        ResolveConfig::load(Some(&path)),
        Err(ResolveError::Common(_))
    ));
}
