//! Proxy descriptors received inside payloads.
//!
//! A daemon may return a proxy (for example from a name server lookup or an
//! auto-proxied object). It arrives as a `Pyro4.core.Proxy` record whose state
//! is `(uri, oneway, methods, attrs, timeout, hmac, handshake, maxretries)`,
//! or, from a text serializer, as a class dictionary with the same state
//! except that the uri is a string.

use crate::core::value::{ClassDict, Key, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::class_dicts::proxy_from_dict;
use crate::protocol::uri::PyroUri;
use std::collections::BTreeSet;

pub const PROXY_CLASS: &str = "Pyro4.core.Proxy";

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRef {
    pub uri: PyroUri,
    pub oneway: BTreeSet<String>,
    pub methods: BTreeSet<String>,
    pub attrs: BTreeSet<String>,
    /// Seconds; `None` means no timeout.
    pub timeout: Option<f64>,
    pub handshake: Value,
}

impl ProxyRef {
    pub fn new(uri: PyroUri) -> Self {
        Self {
            uri,
            oneway: BTreeSet::new(),
            methods: BTreeSet::new(),
            attrs: BTreeSet::new(),
            timeout: None,
            handshake: Value::from("hello"),
        }
    }

    fn timeout_value(&self) -> Value {
        Value::Float(self.timeout.unwrap_or(0.0))
    }

    pub fn to_value(&self) -> Value {
        let mut record = ClassDict::new(PROXY_CLASS);
        record.state = Some(Value::tuple(vec![
            self.uri.to_value(),
            string_set(&self.oneway),
            string_set(&self.methods),
            string_set(&self.attrs),
            self.timeout_value(),
            Value::None,
            self.handshake.clone(),
            Value::Int(0),
        ]));
        Value::object(record)
    }

    pub fn to_dict(&self) -> Value {
        Value::dict([
            ("__class__".into(), Value::from(PROXY_CLASS)),
            (
                "state".into(),
                Value::tuple(vec![
                    Value::from(self.uri.to_string()),
                    string_tuple(&self.oneway),
                    string_tuple(&self.methods),
                    string_tuple(&self.attrs),
                    self.timeout_value(),
                    Value::None,
                    self.handshake.clone(),
                    Value::Int(0),
                ]),
            ),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(proxy) = value.as_native::<ProxyRef>() {
            return Ok(proxy.clone());
        }
        match value {
            Value::Dict(_) => proxy_from_dict(value),
            Value::Object(record) => {
                let record = record.read();
                if record.class_name() != PROXY_CLASS {
                    return Err(ProtocolError::Decode(format!(
                        "expected {PROXY_CLASS}, found {}",
                        record.class_name()
                    )));
                }
                match (&record.state, record.args.as_slice()) {
                    (Some(state), _) => Self::from_state(state),
                    (None, [uri]) => Ok(Self::new(PyroUri::from_value(uri)?)),
                    (None, _) => Err(ProtocolError::Decode("proxy record without state".into())),
                }
            }
            other => Err(ProtocolError::Decode(format!(
                "cannot convert {} to a proxy",
                other.type_name()
            ))),
        }
    }

    /// Interpret a state sequence; only the uri is mandatory.
    pub(crate) fn from_state(state: &Value) -> Result<Self> {
        let items = state
            .elements()
            .ok_or_else(|| ProtocolError::Decode("proxy state must be a sequence".into()))?;
        let uri = items
            .first()
            .ok_or_else(|| ProtocolError::Decode("proxy state is empty".into()))?;
        let mut proxy = Self::new(PyroUri::from_value(uri)?);
        // older daemons send (uri, oneway, timeout)
        if let [_, oneway, timeout] = items.as_slice() {
            proxy.oneway = names(oneway)?;
            proxy.timeout = timeout.as_f64().filter(|t| *t > 0.0);
            return Ok(proxy);
        }
        if let Some(v) = items.get(1) {
            proxy.oneway = names(v)?;
        }
        if let Some(v) = items.get(2) {
            proxy.methods = names(v)?;
        }
        if let Some(v) = items.get(3) {
            proxy.attrs = names(v)?;
        }
        proxy.timeout = items
            .get(4)
            .and_then(Value::as_f64)
            .filter(|t| *t > 0.0);
        if let Some(handshake) = items.get(6) {
            proxy.handshake = handshake.clone();
        }
        Ok(proxy)
    }
}

fn string_set(names: &BTreeSet<String>) -> Value {
    Value::set(names.iter().map(|n| Key::String(n.clone())))
}

fn string_tuple(names: &BTreeSet<String>) -> Value {
    Value::tuple(names.iter().map(|n| Value::from(n.as_str())).collect())
}

/// Member names arrive as a set, list or tuple depending on the serializer.
pub(crate) fn names(value: &Value) -> Result<BTreeSet<String>> {
    if value.is_none() {
        return Ok(BTreeSet::new());
    }
    value
        .elements()
        .ok_or_else(|| {
            ProtocolError::Decode(format!(
                "expected a collection of names, found {}",
                value.type_name()
            ))
        })?
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ProtocolError::Decode(format!("member name is not a string: {item:?}"))
            })
        })
        .collect()
}
