//! Pyro object URIs.
//!
//! Accepted forms:
//! - `PYRO:objectid@host:port`
//! - `PYRO:objectid@[ipv6]:port`
//! - `PYRO:objectid@./u:/path/to/socket`
//! - `PYRONAME:name` and `PYROMETA:tags` (no location required)

use crate::core::value::{ClassDict, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::class_dicts::uri_from_dict;
use std::fmt;
use std::str::FromStr;

/// Qualified name Pyro pickles URIs under.
pub const URI_CLASS: &str = "Pyro4.core.URI";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PyroUri {
    pub protocol: String,
    pub object_id: String,
    /// Empty for unix-socket URIs and for name lookups.
    pub host: String,
    pub port: u16,
    pub sockname: Option<String>,
}

impl PyroUri {
    pub fn new(object_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: "PYRO".to_string(),
            object_id: object_id.into(),
            host: host.into(),
            port,
            sockname: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| ProtocolError::InvalidUri(format!("{reason}: {text:?}"));

        let text = text.trim();
        if text.chars().any(char::is_whitespace) {
            return Err(invalid("invalid URI string"));
        }
        let (protocol, rest) = text
            .split_once(':')
            .ok_or_else(|| invalid("invalid URI string"))?;
        let valid_protocol = protocol.starts_with("PYRO")
            && protocol[4..].chars().all(|c| c.is_ascii_uppercase());
        if !valid_protocol {
            return Err(invalid("invalid URI string"));
        }

        let (object_id, location) = match rest.split_once('@') {
            Some((object_id, location)) => (object_id, Some(location)),
            None => (rest, None),
        };
        if object_id.is_empty() {
            return Err(invalid("invalid URI string"));
        }

        let mut uri = PyroUri {
            protocol: protocol.to_string(),
            object_id: object_id.to_string(),
            host: String::new(),
            port: 0,
            sockname: None,
        };

        let Some(location) = location else {
            if protocol == "PYRO" {
                return Err(invalid("PYRO uri requires a location"));
            }
            return Ok(uri);
        };

        if let Some(socket) = location.strip_prefix("./u:") {
            if socket.is_empty() {
                return Err(invalid("empty socket name"));
            }
            uri.sockname = Some(socket.to_string());
        } else if let Some(bracketed) = location.strip_prefix('[') {
            if bracketed.starts_with('[') {
                return Err(invalid("invalid ipv6 address: enclosed in too many brackets"));
            }
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("invalid ipv6 address"))?;
            let numeric = !host.is_empty()
                && host.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '%');
            if !numeric {
                return Err(invalid(
                    "invalid ipv6 address: the part between brackets must be a numeric ipv6 address",
                ));
            }
            uri.host = host.to_string();
            uri.port = match after.strip_prefix(':') {
                Some(port) => parse_port(port).ok_or_else(|| invalid("invalid port"))?,
                None if after.is_empty() => 0,
                None => return Err(invalid("invalid ipv6 location")),
            };
        } else {
            let (host, port) = location
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            uri.host = host.to_string();
            uri.port = parse_port(port).ok_or_else(|| invalid("invalid port"))?;
        }
        Ok(uri)
    }

    /// `host:port` suitable for a socket connect.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Pickle form: a `Pyro4.core.URI` record whose state is
    /// `(protocol, object, sockname, host, port)`.
    pub fn to_value(&self) -> Value {
        let mut record = ClassDict::new(URI_CLASS);
        record.state = Some(self.state_tuple());
        Value::object(record)
    }

    /// Dictionary form used by the text serializers.
    pub fn to_dict(&self) -> Value {
        Value::dict([
            ("__class__".into(), Value::from(URI_CLASS)),
            ("state".into(), self.state_tuple()),
        ])
    }

    fn state_tuple(&self) -> Value {
        let host = (!self.host.is_empty()).then(|| self.host.clone());
        Value::tuple(vec![
            Value::from(self.protocol.as_str()),
            Value::from(self.object_id.as_str()),
            Value::from(self.sockname.clone()),
            Value::from(host),
            Value::Int(i64::from(self.port)),
        ])
    }

    /// Recover a URI from any of its decoded shapes: a native value, a URI
    /// string, a pickled record or a class dictionary.
    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(uri) = value.as_native::<PyroUri>() {
            return Ok(uri.clone());
        }
        match value {
            Value::String(text) => Self::parse(text),
            Value::Dict(_) => uri_from_dict(value),
            Value::Object(record) => {
                let record = record.read();
                if record.class_name() != URI_CLASS {
                    return Err(ProtocolError::Decode(format!(
                        "expected {URI_CLASS}, found {}",
                        record.class_name()
                    )));
                }
                if let [Value::String(text)] = record.args.as_slice() {
                    return Self::parse(text);
                }
                let state = record
                    .state
                    .as_ref()
                    .ok_or_else(|| ProtocolError::Decode("URI record without state".into()))?;
                Self::from_state(state)
            }
            other => Err(ProtocolError::Decode(format!(
                "cannot convert {} to a Pyro URI",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn from_state(state: &Value) -> Result<Self> {
        let items = state
            .elements()
            .ok_or_else(|| ProtocolError::Decode("URI state must be a sequence".into()))?;
        let [protocol, object_id, sockname, host, port] = items.as_slice() else {
            return Err(ProtocolError::Decode(format!(
                "URI state must have 5 items, found {}",
                items.len()
            )));
        };
        let text = |v: &Value, field: &str| -> Result<Option<String>> {
            match v {
                Value::None => Ok(None),
                Value::String(s) => Ok(Some(s.clone())),
                other => Err(ProtocolError::Decode(format!(
                    "URI {field} must be a string, found {}",
                    other.type_name()
                ))),
            }
        };
        let port = match port {
            Value::None => 0,
            other => other
                .as_i64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| ProtocolError::Decode(format!("invalid URI port {other:?}")))?,
        };
        Ok(Self {
            protocol: text(protocol, "protocol")?.unwrap_or_else(|| "PYRO".to_string()),
            object_id: text(object_id, "object")?.unwrap_or_default(),
            sockname: text(sockname, "sockname")?,
            host: text(host, "host")?.unwrap_or_default(),
            port,
        })
    }
}

fn parse_port(text: &str) -> Option<u16> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

impl FromStr for PyroUri {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PyroUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.object_id)?;
        if let Some(sockname) = &self.sockname {
            write!(f, "@./u:{sockname}")
        } else if self.host.is_empty() {
            Ok(())
        } else {
            write!(f, "@{}", self.socket_addr())
        }
    }
}
