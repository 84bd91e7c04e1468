//! # Error Types
//!
//! Comprehensive error handling for the pickle codec and the Pyro wire protocol.
//!
//! This module defines all error variants that can occur while decoding or encoding
//! pickle streams, framing envelopes, and talking to a remote daemon.
//!
//! ## Error Categories
//! - **Decode Errors**: Malformed opcode streams, memo misuse, bad text encodings
//! - **Encode Errors**: Unregistered native types, values a codec cannot represent
//! - **Protocol Errors**: Bad magic, version skew, length or sequence mismatches
//! - **Authentication Errors**: HMAC mismatch or asymmetric key configuration
//! - **Connection Errors**: Refused, reset or timed out transports (retryable)
//! - **Remote Errors**: Exceptions raised by the remote peer
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use pyro_wire::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn parse_port(text: &str) -> Result<u16> {
//!     text.parse::<u16>()
//!         .map_err(|e| ProtocolError::ConfigError(format!("bad port: {e}")))
//! }
//!
//! fn main() {
//!     match parse_port("9090") {
//!         Ok(port) => info!(port, "Parsed port"),
//!         Err(e) => error!(error=%e, "Error parsing port"),
//!     }
//! }
//! ```

use crate::protocol::remote_error::RemoteError;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Envelope validation errors
    pub const ERR_INVALID_HEADER: &str = "Invalid protocol header";
    pub const ERR_HMAC_MISMATCH: &str = "message hmac mismatch";
    pub const ERR_HMAC_ASYMMETRIC: &str = "hmac key config not symmetric";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "proxy is not connected";

    /// Decode errors
    pub const ERR_STACK_EMPTY: &str = "stack underflow";
    pub const ERR_NO_MARK: &str = "mark not found on stack";
    pub const ERR_INVALID_MEMO_KEY: &str = "invalid memo key";
    pub const ERR_MEMO_OVERWRITE: &str = "memo id already assigned";
    pub const ERR_NESTING_TOO_DEEP: &str = "containers nested deeper than the decoder allows";
    pub const ERR_BAD_STOP: &str = "stop opcode must leave exactly one value on the stack";
    pub const ERR_NO_PERSISTENT_LOAD: &str =
        "A load persistent id instruction was encountered, but no persistent_load hook was installed";

    /// Encode errors
    pub const ERR_RECURSION_LIMIT: &str = "maximum recursion depth exceeded";

    /// Call errors
    pub const ERR_CALL_ATTRIBUTE: &str = "cannot call an attribute";
    pub const ERR_NO_EXPOSED_MEMBERS: &str = "remote object doesn't expose any methods or attributes";
    pub const ERR_STREAM_NOT_ALLOWED: &str =
        "result of call is an iterator, but the server is not configured to allow streaming";
    pub const ERR_STREAM_CLOSED: &str = "the proxy for this stream result has been closed";
}

// ProtocolError is the primary error type for all codec and client operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("truncated input: needed {needed} more bytes at offset {offset}")]
    Truncated { needed: usize, offset: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("failed to construct {class}: {reason}")]
    Construct { class: String, reason: String },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Length mismatch: header declares {declared} bytes, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Message too large: {0} bytes")]
    OversizedMessage(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("result msg out of sync: expected seq {expected}, received {received}")]
    SequenceMismatch { expected: u32, received: u32 },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Unsupported serializer id: {0}")]
    UnsupportedSerializer(u16),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Remote error: {0}")]
    Remote(Box<RemoteError>),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("Invalid call: {0}")]
    InvalidCall(String),

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Connection-level failures that allow one transparent reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Timeout
                | ProtocolError::Connection(_)
        )
    }

    /// Whether the cached connection must be dropped after this error.
    pub fn closes_connection(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                ProtocolError::InvalidHeader
                    | ProtocolError::UnsupportedVersion(_)
                    | ProtocolError::LengthMismatch { .. }
                    | ProtocolError::OversizedMessage(_)
                    | ProtocolError::Protocol(_)
                    | ProtocolError::SequenceMismatch { .. }
                    | ProtocolError::Authentication(_)
                    | ProtocolError::HandshakeError(_)
            )
    }

    /// The remote exception record, if this error came from the peer.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ProtocolError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RemoteError> for ProtocolError {
    fn from(err: RemoteError) -> Self {
        ProtocolError::Remote(Box::new(err))
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
