//! Bridge Geo - Tor bridge geo-enrichment
//!
//! Downloads published Tor bridge lists and an offline geo-database, resolves
//! every bridge address to a country and autonomous system, and writes
//! per-country and per-AS statistics as a JSON report.

pub mod bridge;
pub mod config;
pub mod logging;
pub mod pipeline;

pub use bridge::*;
pub use config::{AnalyzerConfig, LogLevel, Settings};
pub use pipeline::Pipeline;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
