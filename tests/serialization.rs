//! Integration tests for the payload serializers
//!
//! Covers the serializer registry, the pickle and json codecs, a serpent
//! codec backed by a test adapter, and the Pyro types each one carries.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use pyro_wire::config::{SerializerConfig, SerializerKind};
use pyro_wire::core::serialization::{Kwargs, PickleSerializer, SerializerId};
use pyro_wire::core::unpickler::default_registry;
use pyro_wire::core::value::Key;
use pyro_wire::protocol::json::{json_to_value, value_to_json};
use pyro_wire::protocol::proxy_ref::ProxyRef;
use pyro_wire::protocol::serpent::{SerpentAdapter, SerpentSerializer};
use pyro_wire::{
    loads, PayloadSerializer, ProtocolError, PyroUri, RemoteError, SerializerRegistry, Value,
};
use std::sync::Arc;

/// Stands in for a serpent library by printing json text.
struct JsonText;

impl SerpentAdapter for JsonText {
    fn serialize(&self, value: &Value) -> pyro_wire::Result<Vec<u8>> {
        serde_json::to_vec(&value_to_json(value)?).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn parse(&self, data: &[u8]) -> pyro_wire::Result<Value> {
        let json = serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(json_to_value(json))
    }
}

fn uri() -> PyroUri {
    PyroUri::parse("PYRO:inventory@warehouse.local:9090").unwrap()
}

#[test]
fn test_registry_defaults() {
    let registry = SerializerRegistry::default();
    assert_eq!(registry.preferred_id(), SerializerId::Pickle);
    assert!(registry.contains(SerializerId::Pickle));
    assert!(registry.contains(SerializerId::Json));
    assert!(!registry.contains(SerializerId::Serpent));
    assert!(matches!(
        registry.get(SerializerId::Marshal),
        Err(ProtocolError::UnsupportedSerializer(3))
    ));
}

#[test]
fn test_registry_from_config() {
    let config = SerializerConfig {
        kind: SerializerKind::Json,
        pickle_protocol: 4,
    };
    let registry = SerializerRegistry::from_config(&config, default_registry()).unwrap();
    assert_eq!(registry.preferred().unwrap().id(), SerializerId::Json);

    let bad = SerializerConfig {
        kind: SerializerKind::Pickle,
        pickle_protocol: 1,
    };
    assert!(SerializerRegistry::from_config(&bad, default_registry()).is_err());
}

#[test]
fn test_serpent_preference_needs_registration() {
    let config = SerializerConfig {
        kind: SerializerKind::Serpent,
        ..SerializerConfig::default()
    };
    let registry = SerializerRegistry::from_config(&config, default_registry()).unwrap();
    assert!(matches!(
        registry.preferred(),
        Err(ProtocolError::UnsupportedSerializer(1))
    ));

    let registry = registry.with(SerpentSerializer::new(JsonText));
    assert_eq!(registry.preferred().unwrap().id(), SerializerId::Serpent);
}

#[test]
fn test_pickle_protocol_is_written() {
    let ser = PickleSerializer::new(default_registry(), 4).unwrap();
    let bytes = ser.serialize_data(&Value::Int(1)).unwrap();
    assert_eq!(&bytes[..2], &[0x80, 4]);
    assert!(PickleSerializer::new(default_registry(), 9).is_err());
}

#[test]
fn test_pickle_call_shape() {
    let ser = PickleSerializer::default();
    let mut kwargs = Kwargs::new();
    kwargs.insert("limit".into(), Value::Int(10));
    let bytes = ser
        .serialize_call("inventory", "list", &[Value::from("apples")], &kwargs)
        .unwrap();
    let call = loads(&bytes).unwrap();
    assert!(matches!(call, Value::Tuple(_)));
    let parts = call.elements().unwrap();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[2], Value::tuple(vec![Value::from("apples")]));
    assert_eq!(parts[3].get_item("limit"), Some(Value::Int(10)));
}

#[test]
fn test_pickled_uri_is_native_again() {
    let ser = PickleSerializer::default();
    let bytes = ser.serialize_data(&Value::native(uri())).unwrap();
    let value = ser.deserialize_data(&bytes).unwrap();
    assert_eq!(value.as_native::<PyroUri>(), Some(&uri()));
}

#[test]
fn test_pickled_proxy_descriptor() {
    let mut proxy = ProxyRef::new(uri());
    proxy.methods.insert("list".into());
    proxy.oneway.insert("restock".into());
    proxy.timeout = Some(2.5);

    let ser = PickleSerializer::default();
    let value = ser
        .deserialize_data(&ser.serialize_data(&Value::native(proxy.clone())).unwrap())
        .unwrap();
    assert_eq!(ProxyRef::from_value(&value).unwrap(), proxy);
}

#[test]
fn test_json_exception_payload() {
    let ser = SerializerRegistry::default();
    let json = ser.get(SerializerId::Json).unwrap();
    let err = RemoteError::new("shop.OutOfStock", "no apples left");
    let bytes = json.serialize_data(&Value::native(err.clone())).unwrap();

    let text: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(text["__class__"], "shop.OutOfStock");
    assert_eq!(text["__exception__"], true);
    assert_eq!(text["args"], serde_json::json!(["no apples left"]));

    let back = json.deserialize_data(&bytes).unwrap();
    assert_eq!(RemoteError::from_value(&back).unwrap(), err);
}

#[test]
fn test_json_rejects_bytes() {
    let ser = SerializerRegistry::default();
    let json = ser.get(SerializerId::Json).unwrap();
    assert!(matches!(
        json.serialize_call("inventory", "store", &[Value::Bytes(vec![1])], &Kwargs::new()),
        Err(ProtocolError::Encode(_))
    ));
}

#[test]
fn test_serpent_codec_resolves_pyro_types() {
    let ser = SerpentSerializer::with_registry(JsonText, default_registry());
    let value = Value::dict([
        (Key::from("where"), Value::native(uri())),
        (Key::from("count"), Value::Int(3)),
    ]);
    let bytes = ser.serialize_data(&value).unwrap();
    let back = ser.deserialize_data(&bytes).unwrap();
    assert_eq!(back.get_item("where").unwrap().as_native::<PyroUri>(), Some(&uri()));
    assert_eq!(back.get_item("count"), Some(Value::Int(3)));
}

#[test]
fn test_custom_registry_shared_by_codecs() {
    let registry = Arc::new(pyro_wire::RegistryBuilder::new().build());
    let pickle = PickleSerializer::new(Arc::clone(&registry), 2).unwrap();
    let serializers = SerializerRegistry::new(SerializerId::Pickle).with(pickle);
    assert!(serializers.get(SerializerId::Json).is_err());
    assert_eq!(serializers.preferred().unwrap().id(), SerializerId::Pickle);
}
