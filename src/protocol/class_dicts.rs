//! Class dictionaries: how the text serializers carry Pyro types.
//!
//! Neither json nor serpent can name a class, so Pyro writes special objects
//! as dictionaries tagged with `__class__` (and `__exception__` for
//! exceptions). On the way in, [`resolve_class_dicts`] turns the dictionaries
//! this crate understands back into URIs, proxies and remote errors and
//! leaves every other dictionary untouched. On the way out,
//! [`to_text_form`] lowers native values and records into plain
//! dictionaries the text codecs can write.

use crate::core::constructors::is_exception_class;
use crate::core::registry::Registry;
use crate::core::stdlib;
use crate::core::value::{Key, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::proxy_ref::{ProxyRef, PROXY_CLASS};
use crate::protocol::remote_error::RemoteError;
use crate::protocol::uri::{PyroUri, URI_CLASS};

/// `{"__class__": "Pyro4.core.URI", "state": (protocol, object, sockname, host, port)}`
pub fn uri_from_dict(dict: &Value) -> Result<PyroUri> {
    let state = dict
        .get_item("state")
        .ok_or_else(|| ProtocolError::Decode("URI dictionary without state".into()))?;
    PyroUri::from_state(&state)
}

/// `{"__class__": "Pyro4.core.Proxy", "state": (uri, oneway, methods, attrs, timeout, ...)}`
pub fn proxy_from_dict(dict: &Value) -> Result<ProxyRef> {
    let state = dict
        .get_item("state")
        .ok_or_else(|| ProtocolError::Decode("proxy dictionary without state".into()))?;
    ProxyRef::from_state(&state)
}

/// `{"__class__": ..., "__exception__": True, "args": (...), "attributes": {...}}`
pub fn exception_from_dict(dict: &Value) -> Result<RemoteError> {
    let type_tag = match dict.get_item("__class__") {
        Some(Value::String(name)) => name,
        Some(other) => {
            return Err(ProtocolError::Decode(format!(
                "exception __class__ must be a string, found {}",
                other.type_name()
            )))
        }
        None => "builtins.Exception".to_string(),
    };
    let args = match dict.get_item("args") {
        None | Some(Value::None) => Vec::new(),
        Some(args) => args.elements().ok_or_else(|| {
            ProtocolError::Decode(format!(
                "exception args must be a sequence, found {}",
                args.type_name()
            ))
        })?,
    };
    let attributes = dict.get_item("attributes").unwrap_or(Value::None);
    RemoteError::from_parts(type_tag, &args, &attributes)
}

fn is_exception_dict(dict: &Value) -> bool {
    dict.get_item("__exception__")
        .and_then(|flag| flag.as_bool())
        .unwrap_or(false)
}

/// Convert one tagged dictionary; `None` when the tag is not a known type.
pub fn convert_class_dict(dict: &Value) -> Result<Option<Value>> {
    if is_exception_dict(dict) {
        return exception_from_dict(dict).map(|e| Some(Value::native(e)));
    }
    match dict.get_item("__class__").as_ref().and_then(Value::as_str) {
        Some(URI_CLASS) => uri_from_dict(dict).map(|u| Some(Value::native(u))),
        Some(PROXY_CLASS) => proxy_from_dict(dict).map(|p| Some(Value::native(p))),
        _ => Ok(None),
    }
}

/// Rebuild a decoded text payload, replacing known class dictionaries.
pub fn resolve_class_dicts(value: Value) -> Result<Value> {
    match value {
        Value::List(items) => {
            let items = items.read().clone();
            Ok(Value::list(
                items
                    .into_iter()
                    .map(resolve_class_dicts)
                    .collect::<Result<_>>()?,
            ))
        }
        Value::Tuple(items) => Ok(Value::tuple(
            items
                .iter()
                .cloned()
                .map(resolve_class_dicts)
                .collect::<Result<_>>()?,
        )),
        Value::Dict(dict) => {
            let entries = dict.read().clone();
            let rebuilt = Value::dict(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, resolve_class_dicts(v)?)))
                    .collect::<Result<Vec<_>>>()?,
            );
            Ok(convert_class_dict(&rebuilt)?.unwrap_or(rebuilt))
        }
        other => Ok(other),
    }
}

/// Lower natives and records into dictionaries a text codec can write.
pub fn to_text_form(value: &Value, registry: &Registry) -> Result<Value> {
    let mut active = Vec::new();
    lower(value, registry, &mut active)
}

fn lower(value: &Value, registry: &Registry, active: &mut Vec<usize>) -> Result<Value> {
    if let Some(id) = value.identity() {
        if active.contains(&id) {
            return Err(ProtocolError::Encode(
                "cyclic structures cannot be written by a text serializer".into(),
            ));
        }
        active.push(id);
        let lowered = lower_container(value, registry, active);
        active.pop();
        return lowered;
    }
    match value {
        Value::Native(native) => {
            if let Some(uri) = native.downcast_ref::<PyroUri>() {
                Ok(uri.to_dict())
            } else if let Some(err) = native.downcast_ref::<RemoteError>() {
                lower(&err.to_dict(), registry, active)
            } else if let Some(proxy) = native.downcast_ref::<ProxyRef>() {
                lower(&proxy.to_dict(), registry, active)
            } else if let Some(text) = stdlib::text_form(native) {
                Ok(text)
            } else {
                let base = registry.encode_native(native)?;
                lower(&base, registry, active)
            }
        }
        Value::Class(class) => Err(ProtocolError::Encode(format!(
            "class reference {class} cannot be written by a text serializer"
        ))),
        scalar => Ok(scalar.clone()),
    }
}

fn lower_container(value: &Value, registry: &Registry, active: &mut Vec<usize>) -> Result<Value> {
    let lower_all = |items: &[Value], active: &mut Vec<usize>| -> Result<Vec<Value>> {
        items.iter().map(|v| lower(v, registry, active)).collect()
    };
    Ok(match value {
        Value::List(items) => {
            let items = items.read().clone();
            Value::list(lower_all(&items, active)?)
        }
        Value::Tuple(items) => Value::tuple(lower_all(items, active)?),
        Value::Dict(dict) => {
            let entries = dict.read().clone();
            let mut lowered = Vec::with_capacity(entries.len());
            for (key, v) in entries {
                lowered.push((key, lower(&v, registry, active)?));
            }
            Value::dict(lowered)
        }
        Value::Set(_) | Value::FrozenSet(_) => value.clone(),
        Value::Object(record) => {
            let record = record.read().clone();
            let class = record.class_ref();
            if is_exception_class(&class.module, &class.name) {
                let err = RemoteError::from_value(&Value::object(record))?;
                return lower(&err.to_dict(), registry, active);
            }
            let mut entries = vec![(Key::from("__class__"), Value::from(record.class_name()))];
            for (name, v) in &record.fields {
                entries.push((Key::String(name.clone()), lower(v, registry, active)?));
            }
            if let Some(state) = &record.state {
                entries.push((Key::from("state"), lower(state, registry, active)?));
            }
            Value::dict(entries)
        }
        other => other.clone(),
    })
}
