//! # Pyro Protocol
//!
//! Pyro semantics layered on top of the envelope: the records Pyro exchanges
//! (URIs, proxies, remote exceptions), the text payload codecs and the
//! connection handshake.
//!
//! ## Components
//! - **Uri**: `PYRO:object@host:port` addresses
//! - **RemoteError**: Exceptions raised by the daemon
//! - **ProxyRef**: Proxy descriptors received in payloads
//! - **Class dicts**: The dictionary forms text codecs use for Pyro types
//! - **Json / Serpent**: Text payload codecs
//! - **Handshake**: CONNECT payloads, responses, metadata and validation

pub mod class_dicts;
pub mod handshake;
pub mod json;
pub mod proxy_ref;
pub mod remote_error;
pub mod serpent;
pub mod uri;


pub use handshake::{AcceptAll, HandshakeValidator, Metadata};
pub use proxy_ref::ProxyRef;
pub use remote_error::RemoteError;
pub use uri::PyroUri;
