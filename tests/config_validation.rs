//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use pyro_wire::config::{ClientConfig, LoggingConfig, PyroConfig, SerializerConfig, SerializerKind};
use pyro_wire::core::serialization::SerializerId;
use pyro_wire::error::ProtocolError;
use std::io::Write;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = PyroConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    config.validate_strict().expect("strict validation");
}

#[test]
fn test_short_timeouts_reported() {
    let config = PyroConfig::default_with_overrides(|c| {
        c.client.connection_timeout = Duration::from_millis(5);
        c.client.response_timeout = Duration::from_millis(5);
        c.client.send_timeout = Duration::from_millis(1);
    });
    let errors = config.validate();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().any(|e| e.contains("Connection timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Response timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Send timeout too short")));
}

#[test]
fn test_empty_hmac_key_reported() {
    let client = ClientConfig {
        hmac_key: Some(String::new()),
        ..ClientConfig::default()
    };
    assert!(client.validate().iter().any(|e| e.contains("HMAC key cannot be empty")));
    assert_eq!(client.hmac_key_bytes(), Some(Vec::new()));
}

#[test]
fn test_message_size_bounds() {
    let mut client = ClientConfig {
        max_message_size: 100,
        ..ClientConfig::default()
    };
    assert!(client.validate().iter().any(|e| e.contains("too small")));

    client.max_message_size = 200 * 1024 * 1024;
    assert!(client.validate().iter().any(|e| e.contains("too large")));
}

#[test]
fn test_compression_threshold_above_limit() {
    let client = ClientConfig {
        compression: true,
        compression_threshold_bytes: 64 * 1024,
        max_message_size: 4 * 1024,
        ..ClientConfig::default()
    };
    assert!(client
        .validate()
        .iter()
        .any(|e| e.contains("Compression threshold cannot be larger")));
}

#[test]
fn test_missing_trace_dir_reported() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut client = ClientConfig {
        msg_trace_dir: Some(dir.path().to_string_lossy().into_owned()),
        ..ClientConfig::default()
    };
    assert!(client.validate().is_empty());

    client.msg_trace_dir = Some(dir.path().join("missing").to_string_lossy().into_owned());
    assert!(client
        .validate()
        .iter()
        .any(|e| e.contains("Message trace directory does not exist")));
}

#[test]
fn test_pickle_protocol_range() {
    for protocol in [0u8, 1, 6] {
        let serializer = SerializerConfig {
            pickle_protocol: protocol,
            ..SerializerConfig::default()
        };
        assert!(!serializer.validate().is_empty(), "protocol {protocol}");
    }
    for protocol in 2u8..=5 {
        let serializer = SerializerConfig {
            pickle_protocol: protocol,
            ..SerializerConfig::default()
        };
        assert!(serializer.validate().is_empty(), "protocol {protocol}");
    }
}

#[test]
fn test_logging_outputs() {
    let logging = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));

    let logging = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(logging.validate().iter().any(|e| e.contains("log_file_path")));

    let logging = LoggingConfig {
        app_name: "x".repeat(65),
        ..LoggingConfig::default()
    };
    assert!(logging.validate().iter().any(|e| e.contains("too long")));
}

#[test]
fn test_strict_validation_lists_every_error() {
    let config = PyroConfig::default_with_overrides(|c| {
        c.serializer.pickle_protocol = 9;
        c.logging.app_name = String::new();
    });
    match config.validate_strict() {
        Err(ProtocolError::ConfigError(msg)) => {
            assert!(msg.contains("Invalid pickle protocol"));
            assert!(msg.contains("Application name cannot be empty"));
        }
        other => panic!("expected a config error, got {other:?}"),
    }
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_save_and_load_roundtrip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("pyro.toml");

    let config = PyroConfig::default_with_overrides(|c| {
        c.client.hmac_key = Some("secret".into());
        c.client.compression = true;
        c.client.response_timeout = Duration::from_millis(1500);
        c.serializer.kind = SerializerKind::Json;
        c.serializer.pickle_protocol = 4;
        c.logging.log_level = Level::DEBUG;
    });
    config.save_to_file(&path).expect("save");

    let loaded = PyroConfig::from_file(&path).expect("load");
    assert_eq!(loaded.client.hmac_key.as_deref(), Some("secret"));
    assert!(loaded.client.compression);
    assert_eq!(loaded.client.response_timeout, Duration::from_millis(1500));
    assert_eq!(loaded.serializer.kind.id(), SerializerId::Json);
    assert_eq!(loaded.serializer.pickle_protocol, 4);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_example_config_parses() {
    let example = PyroConfig::example_config();
    let parsed = PyroConfig::from_toml(&example).expect("example parses");
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_malformed_file_is_config_error() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "[client\nmetadata = maybe").expect("write");
    assert!(matches!(
        PyroConfig::from_file(file.path()),
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(matches!(
        PyroConfig::from_file("/nonexistent/pyro.toml"),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_serializer_names() {
    assert_eq!("JSON".parse::<SerializerKind>().unwrap(), SerializerKind::Json);
    assert_eq!(" pickle ".parse::<SerializerKind>().unwrap(), SerializerKind::Pickle);
    assert!("marshal".parse::<SerializerKind>().is_err());
}
