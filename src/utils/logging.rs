//! # Logging Setup
//!
//! Installs a global `tracing` subscriber from a [`LoggingConfig`].
//!
//! The library itself only emits events and spans; applications decide
//! whether to call [`init_logging`]. `RUST_LOG` takes precedence over the
//! configured level when it is set.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber described by `config`.
///
/// # Errors
/// Returns `ProtocolError::ConfigError` when the log file cannot be opened
/// or a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let file_writer = if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be specified when log_to_file is true".into())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}")))?;
        Some(Mutex::new(file))
    } else {
        None
    };

    let console = config.log_to_console;
    let json = config.json_format;

    let console_plain = (console && !json).then(|| fmt::layer().with_target(true));
    let console_json = (console && json).then(|| fmt::layer().json().with_current_span(true));
    let (file_plain, file_json) = match file_writer {
        Some(writer) if json => (None, Some(fmt::layer().json().with_writer(writer))),
        Some(writer) => (Some(fmt::layer().with_ansi(false).with_writer(writer)), None),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_plain)
        .with(console_json)
        .with(file_plain)
        .with(file_json)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_log_path_rejected() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: None,
            ..LoggingConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(ProtocolError::ConfigError(_))));
    }
}
