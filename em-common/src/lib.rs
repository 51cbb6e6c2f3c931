//! # Entity Resolution Common Library
//!
//! Shared code for the entity resolution workspace:
//! - Error type used by configuration and plumbing code
//! - Configuration file resolution and TOML loading
//! - Logging initialization (tracing subscriber)
//! - Progress event bus
//! - Telemetry span store with aggregate statistics

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod telemetry;

pub use error::{Error, Result};
pub use telemetry::{MetricStats, Span, Telemetry, TelemetryReport};
