//! # Client Service
//!
//! The remote-call client built on the envelope and the serializers.
//!
//! ## Components
//! - **Connection**: A framed TCP connection with send/receive timeouts
//! - **Proxy**: Handshake, calls, oneway calls, attributes and reconnects
//! - **Stream**: Pull-based iteration over remote generators

pub mod connection;
pub mod proxy;
pub mod stream;

pub use connection::Connection;
pub use proxy::{PyroProxy, Reply};
pub use stream::{StreamHandle, StreamIterator};
