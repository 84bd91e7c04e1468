//! # Constructor Registry
//!
//! Maps a remote `(module, name)` pair to the strategy the unpickler uses to
//! rebuild an instance, and maps local native types to the encoder functions
//! the pickler uses to lower them into base [`Value`] shapes.
//!
//! ## Lookup Order
//! 1. A custom [`ObjectConstructor`] registered for the qualified name
//! 2. A reflective factory from the explicit registration table
//! 3. The exception naming rule (`Pyro4.errors.*`, `exceptions.*`, builtin `*Error`)
//! 4. The record fallback, which yields a [`ClassDict`]
//!
//! The registry is assembled once with [`RegistryBuilder`] and is immutable
//! afterwards; share it with `Arc<Registry>`.
//!
//! ## Example
//! ```rust
//! use pyro_wire::core::registry::Registry;
//! use pyro_wire::core::value::{ClassRef, Value};
//!
//! let registry = Registry::builder()
//!     .register_constructor("shop.Fruit", |_class: &ClassRef, args: Vec<Value>| {
//!         Ok(Value::list(args))
//!     })
//!     .build();
//! let fruit = registry
//!     .construct(&ClassRef::new("shop", "Fruit"), vec![Value::from("apple")])
//!     .unwrap();
//! assert_eq!(fruit, Value::list(vec![Value::from("apple")]));
//! ```

use crate::core::constructors;
use crate::core::value::{ClassDict, ClassRef, NativeValue, Value};
use crate::error::{ProtocolError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Caller-supplied construction strategy for one qualified class name.
pub trait ObjectConstructor: Send + Sync {
    fn construct(&self, class: &ClassRef, args: Vec<Value>) -> Result<Value>;
}

impl<F> ObjectConstructor for F
where
    F: Fn(&ClassRef, Vec<Value>) -> Result<Value> + Send + Sync,
{
    fn construct(&self, class: &ClassRef, args: Vec<Value>) -> Result<Value> {
        self(class, args)
    }
}

/// Reflective factory: builds a known local shape from positional arguments.
///
/// Failures are reported as plain text and wrapped into
/// [`ProtocolError::Construct`] naming the class.
pub type Factory = fn(&Registry, &ClassRef, Vec<Value>) -> std::result::Result<Value, String>;

type EncoderFn = Arc<dyn Fn(&NativeValue) -> Result<Value> + Send + Sync>;

/// Strategy selected for a qualified class name.
pub enum Construction<'a> {
    Custom(&'a dyn ObjectConstructor),
    Reflective(Factory),
    Record,
}

impl fmt::Debug for Construction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Construction::Custom(_) => f.write_str("Custom"),
            Construction::Reflective(_) => f.write_str("Reflective"),
            Construction::Record => f.write_str("Record"),
        }
    }
}

/// Immutable constructor and encoder tables.
pub struct Registry {
    custom: HashMap<String, Arc<dyn ObjectConstructor>>,
    reflective: HashMap<String, Factory>,
    encoders: HashMap<TypeId, EncoderFn>,
}

impl Registry {
    /// Start from the built-in tables.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Pick the construction strategy for `module.name`.
    pub fn resolve(&self, module: &str, name: &str) -> Construction<'_> {
        let qualified = format!("{module}.{name}");
        if let Some(custom) = self.custom.get(&qualified) {
            return Construction::Custom(custom.as_ref());
        }
        if let Some(factory) = self.reflective.get(&qualified) {
            return Construction::Reflective(*factory);
        }
        if constructors::is_exception_class(module, name) {
            return Construction::Reflective(constructors::exception);
        }
        Construction::Record
    }

    /// Resolve and run the strategy for `class`.
    pub fn construct(&self, class: &ClassRef, args: Vec<Value>) -> Result<Value> {
        let strategy = self.resolve(&class.module, &class.name);
        trace!(class = %class, ?strategy, args = args.len(), "Constructing instance");
        match strategy {
            Construction::Custom(ctor) => ctor.construct(class, args),
            Construction::Reflective(factory) => {
                factory(self, class, args).map_err(|reason| ProtocolError::Construct {
                    class: class.qualified(),
                    reason,
                })
            }
            Construction::Record => Ok(Value::object(ClassDict::with_args(class.qualified(), args))),
        }
    }

    /// Lower a native value through the encoder registered for its type.
    pub fn encode_native(&self, native: &NativeValue) -> Result<Value> {
        let encoder = self.encoders.get(&native.native_type_id()).ok_or_else(|| {
            ProtocolError::Encode(format!(
                "no encoder registered for native type {}",
                native.type_name()
            ))
        })?;
        encoder(native)
    }

    pub fn has_encoder<T: Any>(&self) -> bool {
        self.encoders.contains_key(&TypeId::of::<T>())
    }
}

impl Default for Registry {
    fn default() -> Self {
        RegistryBuilder::new().build()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("custom", &self.custom.len())
            .field("reflective", &self.reflective.len())
            .field("encoders", &self.encoders.len())
            .finish()
    }
}

/// Collects registrations before the registry is frozen.
pub struct RegistryBuilder {
    custom: HashMap<String, Arc<dyn ObjectConstructor>>,
    reflective: HashMap<String, Factory>,
    encoders: HashMap<TypeId, EncoderFn>,
}

impl RegistryBuilder {
    /// Builder pre-loaded with the built-in factories and encoders.
    pub fn new() -> Self {
        let mut builder = Self::empty();
        constructors::install_builtins(&mut builder);
        builder
    }

    /// Builder with no registrations at all; every class becomes a record.
    pub fn empty() -> Self {
        Self {
            custom: HashMap::new(),
            reflective: HashMap::new(),
            encoders: HashMap::new(),
        }
    }

    /// Register a custom strategy; it wins over every other rule.
    pub fn register_constructor<C>(mut self, qualified: impl Into<String>, ctor: C) -> Self
    where
        C: ObjectConstructor + 'static,
    {
        self.custom.insert(qualified.into(), Arc::new(ctor));
        self
    }

    /// Map a qualified name to a reflective factory.
    pub fn register_factory(mut self, qualified: impl Into<String>, factory: Factory) -> Self {
        self.reflective.insert(qualified.into(), factory);
        self
    }

    /// Register the function that lowers native values of type `T`.
    pub fn register_encoder<T, F>(mut self, encode: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> Result<Value> + Send + Sync + 'static,
    {
        self.add_encoder(encode);
        self
    }

    pub(crate) fn add_encoder<T, F>(&mut self, encode: F)
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> Result<Value> + Send + Sync + 'static,
    {
        let encoder: EncoderFn = Arc::new(move |native: &NativeValue| {
            let value = native.downcast_ref::<T>().ok_or_else(|| {
                ProtocolError::Encode(format!("encoder type mismatch for {}", native.type_name()))
            })?;
            encode(value)
        });
        self.encoders.insert(TypeId::of::<T>(), encoder);
    }

    pub(crate) fn add_factory(&mut self, qualified: &str, factory: Factory) {
        self.reflective.insert(qualified.to_string(), factory);
    }

    pub fn build(self) -> Registry {
        Registry {
            custom: self.custom,
            reflective: self.reflective,
            encoders: self.encoders,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_order() {
        let registry = Registry::builder()
            .register_constructor("builtins.set", |_: &ClassRef, _: Vec<Value>| Ok(Value::None))
            .build();

        assert!(matches!(registry.resolve("builtins", "set"), Construction::Custom(_)));
        assert!(matches!(
            registry.resolve("builtins", "frozenset"),
            Construction::Reflective(_)
        ));
        assert!(matches!(
            registry.resolve("Pyro4.errors", "CommunicationError"),
            Construction::Reflective(_)
        ));
        assert!(matches!(
            registry.resolve("shop.models", "Fruit"),
            Construction::Record
        ));
    }

    #[test]
    fn test_record_fallback_keeps_args() {
        let registry = Registry::default();
        let value = registry
            .construct(&ClassRef::new("decimal", "Decimal"), vec![Value::from("12.5")])
            .expect("record");
        let Value::Object(record) = value else {
            panic!("expected record");
        };
        let record = record.read();
        assert_eq!(record.class_name(), "decimal.Decimal");
        assert_eq!(record.args, vec![Value::from("12.5")]);
    }

    #[test]
    fn test_reflective_failure_names_class() {
        let registry = Registry::default();
        let err = registry
            .construct(&ClassRef::new("builtins", "set"), vec![Value::Int(3)])
            .expect_err("int is not iterable");
        match err {
            ProtocolError::Construct { class, .. } => assert_eq!(class, "builtins.set"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unregistered_native_is_encode_error() {
        struct Opaque;
        let registry = Registry::default();
        let native = NativeValue::new(Opaque);
        assert!(matches!(
            registry.encode_native(&native),
            Err(ProtocolError::Encode(_))
        ));
    }

    #[test]
    fn test_registered_encoder_runs() {
        struct Celsius(f64);
        let registry = Registry::builder()
            .register_encoder(|c: &Celsius| Ok(Value::Float(c.0)))
            .build();
        let native = NativeValue::new(Celsius(21.5));
        assert_eq!(registry.encode_native(&native).expect("encode"), Value::Float(21.5));
    }
}
