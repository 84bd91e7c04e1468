//! # pyro-wire
//!
//! A Python pickle codec and a client for Pyro4 daemons.
//!
//! ## Layers
//! - [`core`]: The [`Value`] model, the unpickler and pickler, the constructor
//!   [`Registry`], the HMAC-signed message envelope and the serializer registry
//! - [`protocol`]: Pyro records (URIs, proxy descriptors, remote exceptions),
//!   the json and serpent codecs and the connection handshake
//! - [`service`]: [`PyroProxy`], which performs remote calls over TCP
//! - [`utils`]: Compression, logging, metrics, timeouts and message tracing
//!
//! ## Example
//! ```no_run
//! use pyro_wire::{PyroConfig, PyroProxy, Value};
//!
//! # async fn run() -> pyro_wire::Result<()> {
//! let config = PyroConfig::default();
//! let mut proxy = PyroProxy::from_config("PYRO:calculator@localhost:9090", &config)?;
//! let sum = proxy.call("add", vec![Value::Int(1), Value::Int(2)]).await?;
//! assert_eq!(sum, Value::Int(3));
//! # Ok(())
//! # }
//! ```
//!
//! Decoding a pickle needs no connection:
//! ```
//! use pyro_wire::{loads, Value};
//!
//! let value = loads(b"\x80\x02K\x2a.").unwrap();
//! assert_eq!(value, Value::Int(42));
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use crate::config::PyroConfig;
pub use crate::core::pickler::{dumps, Pickler};
pub use crate::core::stdlib::{PyArray, PyComplex, PyDateTime, PyDecimal, PyTimeZone};
pub use crate::core::unpickler::{loads, Unpickler};
pub use crate::core::{
    Annotations, Message, MessageFlags, MessageType, PayloadSerializer, Registry, RegistryBuilder,
    SerializerId, SerializerRegistry, Value,
};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::{PyroUri, RemoteError};
pub use crate::service::{PyroProxy, Reply, StreamIterator};
