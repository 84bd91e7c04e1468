//! # Configuration Management
//!
//! Centralized configuration for the pickle codec and the Pyro client.
//!
//! This module provides structured configuration for proxies, the payload
//! serializer and logging, including timeouts, the shared HMAC secret,
//! compression and message tracing.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - `PYRO_*` environment variable overrides via `from_env()`
//!
//! ## Security Considerations
//! - Without an HMAC key every message is accepted unauthenticated
//! - `max_message_size` bounds allocations made for a single envelope

use crate::core::serialization::SerializerId;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Wire protocol version spoken by Pyro4 daemons
pub const PROTOCOL_VERSION: u8 = 48;

/// Magic bytes opening every envelope ("PYRO")
pub const MAGIC_BYTES: [u8; 4] = *b"PYRO";

/// Max allowed payload plus annotations size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Object id of the daemon's own management object
pub const DAEMON_NAME: &str = "Pyro.Daemon";

/// Pickle protocol used when none is configured
pub const DEFAULT_PICKLE_PROTOCOL: u8 = 2;

/// Highest pickle protocol understood by the codec
pub const HIGHEST_PICKLE_PROTOCOL: u8 = 5;

/// Everything a proxy needs: connection behaviour, payload codec and logging.
///
/// Each section falls back to its defaults when missing from a TOML file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PyroConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub serializer: SerializerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn config_error(context: &str, err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::ConfigError(format!("{context}: {err}"))
}

impl PyroConfig {
    /// Read and parse a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error(&format!("cannot read {}", path.display()), e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| config_error("invalid TOML configuration", e))
    }

    /// Defaults overlaid with any `PYRO_*` environment variables that are set.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `PYRO_HMAC_KEY` | `client.hmac_key` (empty clears it) |
    /// | `PYRO_SERIALIZER` | `serializer.kind` |
    /// | `PYRO_COMMTIMEOUT_MS` | all three client timeouts |
    /// | `PYRO_METADATA` | `client.metadata` |
    /// | `PYRO_COMPRESSION` | `client.compression` |
    /// | `PYRO_PICKLE_PROTOCOL` | `serializer.pickle_protocol` |
    /// | `PYRO_MSG_TRACE_DIR` | `client.msg_trace_dir` (empty clears it) |
    /// | `PYRO_LOG_LEVEL` | `logging.log_level` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let client = &mut config.client;

        if let Some(key) = lookup("PYRO_HMAC_KEY") {
            client.hmac_key = (!key.is_empty()).then_some(key);
        }
        if let Some(ms) = lookup("PYRO_COMMTIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| config_error("PYRO_COMMTIMEOUT_MS", e))?;
            let timeout = Duration::from_millis(ms);
            client.connection_timeout = timeout;
            client.response_timeout = timeout;
            client.send_timeout = timeout;
        }
        if let Some(flag) = lookup("PYRO_METADATA") {
            client.metadata = parse_flag("PYRO_METADATA", &flag)?;
        }
        if let Some(flag) = lookup("PYRO_COMPRESSION") {
            client.compression = parse_flag("PYRO_COMPRESSION", &flag)?;
        }
        if let Some(dir) = lookup("PYRO_MSG_TRACE_DIR") {
            client.msg_trace_dir = (!dir.is_empty()).then_some(dir);
        }

        if let Some(kind) = lookup("PYRO_SERIALIZER") {
            config.serializer.kind = kind.parse()?;
        }
        if let Some(protocol) = lookup("PYRO_PICKLE_PROTOCOL") {
            config.serializer.pickle_protocol = protocol
                .trim()
                .parse()
                .map_err(|e| config_error("PYRO_PICKLE_PROTOCOL", e))?;
        }
        if let Some(level) = lookup("PYRO_LOG_LEVEL") {
            config.logging.log_level = level
                .trim()
                .parse()
                .map_err(|e| config_error("PYRO_LOG_LEVEL", e))?;
        }

        Ok(config)
    }

    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML, for use as a template.
    pub fn example_config() -> String {
        match toml::to_string_pretty(&Self::default()) {
            Ok(text) => text,
            Err(e) => format!("# example configuration unavailable: {e}\n"),
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text =
            toml::to_string_pretty(self).map_err(|e| config_error("cannot render configuration", e))?;
        let path = path.as_ref();
        std::fs::write(path, text)
            .map_err(|e| config_error(&format!("cannot write {}", path.display()), e))
    }

    /// Every problem found across all sections; empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        self.client
            .validate()
            .into_iter()
            .chain(self.serializer.validate())
            .chain(self.logging.validate())
            .collect()
    }

    /// Like [`validate`](Self::validate) but folds the problems into one error.
    pub fn validate_strict(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "{} configuration problem(s):\n  - {}",
            problems.len(),
            problems.join("\n  - ")
        )))
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ProtocolError::ConfigError(format!(
            "{name}: expected a boolean, got {other:?}"
        ))),
    }
}

/// How a proxy connects, authenticates and frames its calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// TCP connect deadline, in milliseconds on disk
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Deadline for each reply
    #[serde(with = "millis")]
    pub response_timeout: Duration,

    #[serde(with = "millis")]
    pub send_timeout: Duration,

    /// Shared secret for message HMACs; `None` disables authentication
    pub hmac_key: Option<String>,

    /// Handshake data sent with the CONNECT message
    pub handshake: String,

    /// Ask the daemon for the object's exposed members
    pub metadata: bool,

    /// Deflate request payloads above `compression_threshold_bytes`
    pub compression: bool,

    pub compression_threshold_bytes: usize,

    /// Largest envelope (payload plus annotations) accepted from the daemon
    pub max_message_size: usize,

    /// Directory receiving a dump of every sent and received message
    pub msg_trace_dir: Option<String>,

    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: timeout::RESPONSE_TIMEOUT,
            send_timeout: timeout::DEFAULT_TIMEOUT,
            hmac_key: None,
            handshake: String::from("hello"),
            metadata: true,
            compression: false,
            compression_threshold_bytes: 512,
            max_message_size: MAX_MESSAGE_SIZE,
            msg_trace_dir: None,
            tcp_nodelay: true,
        }
    }
}

const MIN_MESSAGE_SIZE: usize = 1024;
const MAX_SANE_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

impl ClientConfig {
    /// The HMAC key as raw bytes, if one is configured.
    pub fn hmac_key_bytes(&self) -> Option<Vec<u8>> {
        self.hmac_key.as_ref().map(|key| key.as_bytes().to_vec())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (label, value, floor_ms) in [
            ("Connection timeout", self.connection_timeout, 100),
            ("Response timeout", self.response_timeout, 100),
            ("Send timeout", self.send_timeout, 10),
        ] {
            if value < Duration::from_millis(floor_ms) {
                problems.push(format!("{label} too short: {value:?} (minimum: {floor_ms}ms)"));
            }
        }

        if self.hmac_key.as_deref() == Some("") {
            problems.push("HMAC key cannot be empty (omit it to disable)".to_string());
        }

        match self.max_message_size {
            size if size < MIN_MESSAGE_SIZE => {
                problems.push(format!("Max message size too small: {size} bytes (minimum: 1 KB)"))
            }
            size if size > MAX_SANE_MESSAGE_SIZE => {
                problems.push(format!("Max message size too large: {size} bytes (maximum: 100 MB)"))
            }
            _ => {}
        }

        if self.compression && self.compression_threshold_bytes > self.max_message_size {
            problems.push(format!(
                "Compression threshold cannot be larger than max message size ({} > {})",
                self.compression_threshold_bytes, self.max_message_size
            ));
        }

        if let Some(dir) = self.msg_trace_dir.as_deref().filter(|d| !Path::new(d).is_dir()) {
            problems.push(format!("Message trace directory does not exist: {dir}"));
        }

        problems
    }
}

/// Payload serializer selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Pickle,
    Json,
    Serpent,
}

impl SerializerKind {
    pub fn id(self) -> SerializerId {
        match self {
            SerializerKind::Pickle => SerializerId::Pickle,
            SerializerKind::Json => SerializerId::Json,
            SerializerKind::Serpent => SerializerId::Serpent,
        }
    }
}

impl std::str::FromStr for SerializerKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pickle" => Ok(SerializerKind::Pickle),
            "json" => Ok(SerializerKind::Json),
            "serpent" => Ok(SerializerKind::Serpent),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown serializer: {other} (expected pickle, json or serpent)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerializerConfig {
    /// Which codec encodes request payloads
    pub kind: SerializerKind,

    /// Pickle protocol written by the pickle serializer
    pub pickle_protocol: u8,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            kind: SerializerKind::Pickle,
            pickle_protocol: DEFAULT_PICKLE_PROTOCOL,
        }
    }
}

impl SerializerConfig {
    pub fn validate(&self) -> Vec<String> {
        if (2..=HIGHEST_PICKLE_PROTOCOL).contains(&self.pickle_protocol) {
            return Vec::new();
        }
        vec![format!(
            "Invalid pickle protocol: {} (valid range: 2-{HIGHEST_PICKLE_PROTOCOL})",
            self.pickle_protocol
        )]
    }
}

/// Where and how log records are written; see [`crate::utils::logging`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub app_name: String,

    /// Stored as a lowercase level name
    #[serde(with = "level_name")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Required when `log_to_file` is set
    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("pyro-wire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

const MAX_APP_NAME_LEN: usize = 64;

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.app_name.len() {
            0 => problems.push("Application name cannot be empty".to_string()),
            len if len > MAX_APP_NAME_LEN => problems.push(format!(
                "Application name too long: {len} characters (maximum: {MAX_APP_NAME_LEN})"
            )),
            _ => {}
        }

        match (self.log_to_file, self.log_file_path.as_deref()) {
            (true, None) => {
                problems.push("log_file_path must be set when log_to_file is enabled".to_string())
            }
            (true, Some(path)) => {
                let parent = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty());
                if let Some(parent) = parent.filter(|p| !p.exists()) {
                    problems.push(format!("Log file directory does not exist: {}", parent.display()));
                }
            }
            (false, _) => {}
        }

        if !self.log_to_console && !self.log_to_file {
            problems.push("At least one logging output (console or file) must be enabled".to_string());
        }

        problems
    }
}

/// `Duration` as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `tracing::Level` as a lowercase name such as `"debug"`.
mod level_name {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("unknown log level {name:?}")))
    }
}
