//! # GoatKit Common
//!
//! Logging configuration and small shared helpers for the GoatKit crates.
//!
//! ## Features
//!
//! - `tracing` subscriber setup (pretty, compact or JSON output)
//! - Wall-clock timestamps for stored entries

use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};

/// Milliseconds since the Unix epoch.
///
/// Returns 0 if the system clock is set before 1970.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
