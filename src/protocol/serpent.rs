//! Serpent payload codec (serializer id 1).
//!
//! Serpent is a Python-literal text format. Parsing and printing the literal
//! syntax is delegated to a [`SerpentAdapter`] supplied by the application;
//! this codec handles the Pyro parts around it: lowering Pyro types into
//! class dictionaries before printing, and turning class dictionaries back
//! into URIs, proxies and remote errors after parsing.

use crate::core::registry::Registry;
use crate::core::serialization::{kwargs_value, Kwargs, PayloadSerializer, SerializerId};
use crate::core::unpickler::default_registry;
use crate::core::value::Value;
use crate::error::Result;
use crate::protocol::class_dicts::{resolve_class_dicts, to_text_form};
use std::fmt;
use std::sync::Arc;

/// External serpent literal printer and parser.
pub trait SerpentAdapter: Send + Sync {
    /// Print a base value (no natives or records) as a serpent document.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    /// Parse a serpent document; dictionaries stay dictionaries.
    fn parse(&self, data: &[u8]) -> Result<Value>;
}

pub struct SerpentSerializer<A: SerpentAdapter> {
    adapter: A,
    registry: Arc<Registry>,
}

impl<A: SerpentAdapter> SerpentSerializer<A> {
    pub fn new(adapter: A) -> Self {
        Self::with_registry(adapter, default_registry())
    }

    pub fn with_registry(adapter: A, registry: Arc<Registry>) -> Self {
        Self { adapter, registry }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

impl<A: SerpentAdapter> fmt::Debug for SerpentSerializer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerpentSerializer").finish_non_exhaustive()
    }
}

impl<A: SerpentAdapter> PayloadSerializer for SerpentSerializer<A> {
    fn id(&self) -> SerializerId {
        SerializerId::Serpent
    }

    fn serialize_data(&self, value: &Value) -> Result<Vec<u8>> {
        self.adapter.serialize(&to_text_form(value, &self.registry)?)
    }

    /// Same `(object, method, args, kwargs)` tuple the pickle codec sends.
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
        resolve_class_dicts(self.adapter.parse(data)?)
    }
}
