//! # Utilities
//!
//! Ambient support for the proxy client.
//!
//! - `compression`: zlib for the COMPRESSED flag, bounded on inflate
//! - `logging`: `tracing-subscriber` setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - `metrics`: process-wide counters and a scope timer
//! - `timeout`: deadline wrappers mapping elapsed futures to `Timeout`
//! - `trace`: optional `.dat` dumps of every envelope sent and received

pub mod compression;
pub mod logging;
pub mod metrics;
pub mod timeout;
pub mod trace;

pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
