//! JSON payload codec (serializer id 2).
//!
//! Calls are written as `{"object", "method", "params", "kwargs"}`. Sets and
//! tuples become arrays, and Pyro types travel as class dictionaries. JSON
//! cannot represent byte strings, integers outside 64 bits or non-finite
//! floats; those are encode errors rather than lossy substitutions.

use crate::core::registry::Registry;
use crate::core::serialization::{kwargs_value, Kwargs, PayloadSerializer, SerializerId};
use crate::core::value::{Key, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::class_dicts::{resolve_class_dicts, to_text_form};
use num_bigint::BigInt;
use serde_json::{Map, Number};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct JsonSerializer {
    registry: Arc<Registry>,
}

impl JsonSerializer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    fn to_json(&self, value: &Value) -> Result<serde_json::Value> {
        value_to_json(&to_text_form(value, &self.registry)?)
    }
}

impl PayloadSerializer for JsonSerializer {
    fn id(&self) -> SerializerId {
        SerializerId::Json
    }

    fn serialize_data(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.to_json(value)?).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn serialize_call(
        &self,
        object: &str,
        method: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Vec<u8>> {
        let call = Value::dict([
            (Key::from("object"), Value::from(object)),
            (Key::from("method"), Value::from(method)),
            (Key::from("params"), Value::list(args.to_vec())),
            (Key::from("kwargs"), kwargs_value(kwargs)),
        ]);
        self.serialize_data(&call)
    }

    fn deserialize_data(&self, data: &[u8]) -> Result<Value> {
        let parsed: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(format!("invalid json: {e}")))?;
        resolve_class_dicts(json_to_value(parsed))
    }
}

/// Convert a base value into a JSON tree.
pub fn value_to_json(value: &Value) -> Result<serde_json::Value> {
    use serde_json::Value as Json;
    Ok(match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number(Number::from(*i)),
        Value::BigInt(b) => {
            return Err(ProtocolError::Encode(format!(
                "integer {b} does not fit in a json number"
            )))
        }
        Value::Float(f) => Json::Number(Number::from_f64(*f).ok_or_else(|| {
            ProtocolError::Encode(format!("float {f} is not representable in json"))
        })?),
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(_) | Value::ByteArray(_) => {
            return Err(ProtocolError::Encode(
                "byte strings are not representable in json".into(),
            ))
        }
        Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::FrozenSet(_) => {
            let items = value.elements().unwrap_or_default();
            Json::Array(items.iter().map(value_to_json).collect::<Result<_>>()?)
        }
        Value::Dict(dict) => {
            let mut map = Map::new();
            for (key, v) in dict.read().iter() {
                map.insert(json_key(key)?, value_to_json(v)?);
            }
            Json::Object(map)
        }
        other => {
            return Err(ProtocolError::Encode(format!(
                "{} is not representable in json",
                other.type_name()
            )))
        }
    })
}

// JSON object keys are strings; scalar keys are spelled the way Python's json module does.
fn json_key(key: &Key) -> Result<String> {
    Ok(match key {
        Key::String(s) => s.clone(),
        Key::Int(i) => i.to_string(),
        Key::Bool(true) => "true".to_string(),
        Key::Bool(false) => "false".to_string(),
        Key::None => "null".to_string(),
        Key::Float(f) if f.is_finite() => format!("{f:?}"),
        other => {
            return Err(ProtocolError::Encode(format!(
                "json keys must be strings, found {other:?}"
            )))
        }
    })
}

/// Convert a parsed JSON tree into a value; objects become dicts.
pub fn json_to_value(json: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::from_bigint(BigInt::from(u))
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::list(items.into_iter().map(json_to_value).collect()),
        Json::Object(map) => Value::dict(
            map.into_iter()
                .map(|(k, v)| (Key::String(k), json_to_value(v))),
        ),
    }
}
