//! Test Helper Utilities
//!
//! Shared utilities for testing em-resolve

#![allow(dead_code)]

pub mod log_capture;
pub mod oracles;

// Re-export commonly used items
pub use log_capture::{capture_logs, LogCapture};
pub use oracles::{text, ConcurrencyTracker, ScriptedOracle};
