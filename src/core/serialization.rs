//! # Payload Serializers
//!
//! An envelope's serializer id selects the codec that produced its payload.
//! This module defines the closed set of ids, the [`PayloadSerializer`]
//! trait every codec implements, the pickle codec, and the
//! [`SerializerRegistry`] a proxy consults on both the send and receive
//! side.
//!
//! ## Serializer Ids
//! | id | codec   |
//! |----|---------|
//! | 1  | serpent |
//! | 2  | json    |
//! | 3  | marshal (recognized, never registered) |
//! | 4  | pickle  |
//!
//! The registry is assembled once before any proxy is created and is shared
//! by `Arc` afterwards; it has no mutating methods past construction.

use crate::config::SerializerConfig;
use crate::core::pickler::Pickler;
use crate::core::registry::Registry;
use crate::core::unpickler::{default_registry, Unpickler};
use crate::core::value::{Key, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::json::JsonSerializer;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Keyword arguments of a remote call, kept in a stable order.
pub type Kwargs = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum SerializerId {
    Serpent = 1,
    Json = 2,
    Marshal = 3,
    Pickle = 4,
}

impl SerializerId {
    pub fn name(self) -> &'static str {
        match self {
            SerializerId::Serpent => "serpent",
            SerializerId::Json => "json",
            SerializerId::Marshal => "marshal",
            SerializerId::Pickle => "pickle",
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for SerializerId {
    type Error = ProtocolError;

    fn try_from(id: u16) -> Result<Self> {
        match id {
            1 => Ok(SerializerId::Serpent),
            2 => Ok(SerializerId::Json),
            3 => Ok(SerializerId::Marshal),
            4 => Ok(SerializerId::Pickle),
            other => Err(ProtocolError::UnsupportedSerializer(other)),
        }
    }
}

impl fmt::Display for SerializerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A payload codec usable inside a Pyro envelope.
pub trait PayloadSerializer: Send + Sync + fmt::Debug {
    fn id(&self) -> SerializerId;

    fn serialize_data(&self, value: &Value) -> Result<Vec<u8>>;

    /// Serialize an invocation of `method` on `object`.
    fn serialize_call(
        &self,
        object: &str,
        method: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Vec<u8>>;

    fn deserialize_data(&self, data: &[u8]) -> Result<Value>;
}

pub(crate) fn kwargs_value(kwargs: &Kwargs) -> Value {
    Value::dict(
        kwargs
            .iter()
            .map(|(name, value)| (Key::String(name.clone()), value.clone())),
    )
}

/// The pickle codec; calls are pickled as `(object, method, args, kwargs)`.
pub struct PickleSerializer {
    registry: Arc<Registry>,
    protocol: u8,
}

impl PickleSerializer {
    pub fn new(registry: Arc<Registry>, protocol: u8) -> Result<Self> {
        // surfaces an out-of-range protocol at construction time
        Pickler::new(Arc::clone(&registry), protocol)?;
        Ok(Self { registry, protocol })
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    fn pickler(&self) -> Result<Pickler> {
        Pickler::new(Arc::clone(&self.registry), self.protocol)
    }
}

impl Default for PickleSerializer {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            protocol: crate::config::DEFAULT_PICKLE_PROTOCOL,
        }
    }
}

impl fmt::Debug for PickleSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickleSerializer")
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl PayloadSerializer for PickleSerializer {
    fn id(&self) -> SerializerId {
        SerializerId::Pickle
    }

    fn serialize_data(&self, value: &Value) -> Result<Vec<u8>> {
        self.pickler()?.dumps(value)
    }

    fn serialize_call(
        &self,
        object: &str,
        method: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Vec<u8>> {
        let call = Value::tuple(vec![
            Value::from(object),
            Value::from(method),
            Value::tuple(args.to_vec()),
            kwargs_value(kwargs),
        ]);
        self.serialize_data(&call)
    }

    fn deserialize_data(&self, data: &[u8]) -> Result<Value> {
        Unpickler::new(Arc::clone(&self.registry)).loads(data)
    }
}

/// Serializers available to a proxy, keyed by id, plus the one it sends with.
#[derive(Debug, Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<SerializerId, Arc<dyn PayloadSerializer>>,
    preferred: SerializerId,
}

impl SerializerRegistry {
    /// An empty registry that will send with `preferred` once it is registered.
    pub fn new(preferred: SerializerId) -> Self {
        Self {
            serializers: HashMap::new(),
            preferred,
        }
    }

    /// Pickle and json, sending with the configured kind.
    ///
    /// A serpent preference needs a [`SerpentSerializer`](crate::protocol::serpent::SerpentSerializer)
    /// added with [`with`](Self::with) before the first call.
    pub fn from_config(config: &SerializerConfig, registry: Arc<Registry>) -> Result<Self> {
        Ok(Self::new(config.kind.id())
            .with(PickleSerializer::new(Arc::clone(&registry), config.pickle_protocol)?)
            .with(JsonSerializer::new(registry)))
    }

    pub fn with<S: PayloadSerializer + 'static>(mut self, serializer: S) -> Self {
        self.serializers.insert(serializer.id(), Arc::new(serializer));
        self
    }

    pub fn with_preferred(mut self, preferred: SerializerId) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn preferred_id(&self) -> SerializerId {
        self.preferred
    }

    /// The serializer used for outgoing messages.
    pub fn preferred(&self) -> Result<&dyn PayloadSerializer> {
        self.get(self.preferred)
    }

    pub fn get(&self, id: SerializerId) -> Result<&dyn PayloadSerializer> {
        self.serializers
            .get(&id)
            .map(|s| s.as_ref())
            .ok_or(ProtocolError::UnsupportedSerializer(id.as_u16()))
    }

    /// Look up the serializer named by a raw header field.
    pub fn get_raw(&self, id: u16) -> Result<&dyn PayloadSerializer> {
        self.get(SerializerId::try_from(id)?)
    }

    pub fn contains(&self, id: SerializerId) -> bool {
        self.serializers.contains_key(&id)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new(SerializerId::Pickle)
            .with(PickleSerializer::default())
            .with(JsonSerializer::new(default_registry()))
    }
}
