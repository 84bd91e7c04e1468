//! # Core Protocol Components
//!
//! The pickle codec, the constructor registry, the message envelope and the
//! payload serializer registry.
//!
//! ## Components
//! - **Value**: The decoded object model shared by every codec
//! - **Unpickler / Pickler**: Pickle protocols 0-5 in, 2-5 out
//! - **Registry**: Class-name to constructor strategies and native encoders
//! - **Stdlib**: Native `datetime`, `decimal`, `complex` and `array` values
//! - **Packet**: The Pyro envelope with HMAC and annotations
//! - **Codec**: Tokio codec for framing envelopes over byte streams
//! - **Serialization**: Serializer ids and the serializer registry
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Type(1)] [Flags(2)] [Serializer(2)] [Seq(4)]
//! [DataLen(4)] [AnnLen(4)] [Reserved(2)] [HMAC(32)] [Annotations] [Payload]
//! ```
//!
//! ## Security
//! - Maximum message size: 16MB (checked from the header before buffering)
//! - Magic bytes and version reject foreign or incompatible streams
//! - Declared lengths must match the received bytes exactly
//! - HMAC-SHA256 digests are compared in constant time

pub mod codec;
pub mod constructors;
pub mod opcodes;
pub mod packet;
pub mod pickler;
pub mod reader;
pub mod registry;
pub mod serialization;
pub mod stdlib;
pub mod unpickler;
pub mod value;

pub use packet::{Annotations, Message, MessageFlags, MessageType};
pub use registry::{Registry, RegistryBuilder};
pub use serialization::{PayloadSerializer, SerializerId, SerializerRegistry};
pub use value::{ClassDict, ClassRef, Key, Value};
