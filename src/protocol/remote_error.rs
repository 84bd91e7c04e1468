//! Exceptions raised by the remote peer.
//!
//! A daemon reports a failed call with an EXCEPTION-flagged response whose
//! payload is the serialized exception. Pickle delivers it as a record built
//! from the exception class (`builtins.ValueError`, `Pyro4.errors.NamingError`,
//! ...). The text serializers deliver a dictionary with `__class__`,
//! `__exception__`, `args` and `attributes` keys. Both shapes convert into a
//! [`RemoteError`], and a `RemoteError` converts back into either one using
//! the same field names.

use crate::core::value::{ClassDict, Key, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::class_dicts::exception_from_dict;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute carrying the formatted remote traceback.
pub const TRACEBACK_ATTRIBUTE: &str = "_pyroTraceback";

const STOP_ITERATION_NAMES: [&str; 3] = ["StopIteration", "StopAsyncIteration", "GeneratorExit"];
const STOP_ITERATION_MODULES: [&str; 3] = ["builtins", "__builtin__", "exceptions"];

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Qualified exception class, e.g. `builtins.ZeroDivisionError`.
    pub type_tag: String,
    pub message: String,
    pub attributes: BTreeMap<String, Value>,
    pub traceback: Option<String>,
}

impl RemoteError {
    pub fn new(type_tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            message: message.into(),
            attributes: BTreeMap::new(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Unqualified class name.
    pub fn short_type(&self) -> &str {
        self.type_tag
            .rsplit_once('.')
            .map_or(self.type_tag.as_str(), |(_, name)| name)
    }

    /// Whether the remote raised the end-of-iteration family of exceptions.
    pub fn is_stop_iteration(&self) -> bool {
        let module = self.type_tag.rsplit_once('.').map(|(module, _)| module);
        STOP_ITERATION_NAMES.contains(&self.short_type())
            && module.map_or(true, |m| STOP_ITERATION_MODULES.contains(&m))
    }

    fn qualified_type(&self) -> String {
        if self.type_tag.contains('.') {
            self.type_tag.clone()
        } else {
            format!("builtins.{}", self.type_tag)
        }
    }

    fn attribute_entries(&self) -> Vec<(Key, Value)> {
        let mut entries: Vec<(Key, Value)> = self
            .attributes
            .iter()
            .map(|(name, value)| (Key::String(name.clone()), value.clone()))
            .collect();
        if let Some(tb) = &self.traceback {
            entries.push((
                Key::from(TRACEBACK_ATTRIBUTE),
                Value::list(vec![Value::from(tb.as_str())]),
            ));
        }
        entries
    }

    /// Pickle form: `REDUCE(class, (message,))` followed by a BUILD of the
    /// attributes, with the traceback as a one-element list.
    pub fn to_value(&self) -> Value {
        let mut record = ClassDict::with_args(
            self.qualified_type(),
            vec![Value::from(self.message.as_str())],
        );
        for (key, value) in self.attribute_entries() {
            if let Key::String(name) = key {
                record.fields.insert(name, value);
            }
        }
        Value::object(record)
    }

    /// Dictionary form used by the text serializers.
    pub fn to_dict(&self) -> Value {
        Value::dict([
            ("__class__".into(), Value::from(self.qualified_type())),
            ("__exception__".into(), Value::Bool(true)),
            (
                "args".into(),
                Value::tuple(vec![Value::from(self.message.as_str())]),
            ),
            ("attributes".into(), Value::dict(self.attribute_entries())),
        ])
    }

    /// Build from a decoded exception payload.
    ///
    /// Payloads that are neither an exception record nor an exception
    /// dictionary still produce an error, tagged with the payload's type.
    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(err) = value.as_native::<RemoteError>() {
            return Ok(err.clone());
        }
        match value {
            Value::Object(record) => {
                let record = record.read();
                let mut attributes = record.fields.clone();
                let traceback = attributes.remove(TRACEBACK_ATTRIBUTE).map(|tb| join_traceback(&tb));
                Ok(Self {
                    type_tag: record.class_name().to_string(),
                    message: message_from_args(&record.args),
                    attributes,
                    traceback,
                })
            }
            Value::Dict(_) if value.get_item("__exception__").is_some() => exception_from_dict(value),
            other => Ok(Self::new(
                format!("builtins.{}", other.type_name()),
                format!("{other:?}"),
            )),
        }
    }

    pub(crate) fn from_parts(type_tag: String, args: &[Value], attributes: &Value) -> Result<Self> {
        let mut fields = BTreeMap::new();
        match attributes {
            Value::None => {}
            Value::Dict(dict) => {
                for (key, value) in dict.read().iter() {
                    let Key::String(name) = key else {
                        return Err(ProtocolError::Decode(format!(
                            "exception attribute name is not a string: {key:?}"
                        )));
                    };
                    fields.insert(name.clone(), value.clone());
                }
            }
            other => {
                return Err(ProtocolError::Decode(format!(
                    "exception attributes must be a dict, found {}",
                    other.type_name()
                )))
            }
        }
        let traceback = fields.remove(TRACEBACK_ATTRIBUTE).map(|tb| join_traceback(&tb));
        Ok(Self {
            type_tag,
            message: message_from_args(args),
            attributes: fields,
            traceback,
        })
    }
}

fn message_from_args(args: &[Value]) -> String {
    match args {
        [] => String::new(),
        [Value::String(text)] => text.clone(),
        [single] => format!("{single:?}"),
        many => format!("{:?}", Value::tuple(many.to_vec())),
    }
}

/// Tracebacks arrive either as one string or as a list of lines.
fn join_traceback(tb: &Value) -> String {
    match tb {
        Value::String(text) => text.clone(),
        other => match other.elements() {
            Some(lines) => lines
                .iter()
                .map(|line| line.as_str().map_or_else(|| format!("{line:?}"), str::to_string))
                .collect(),
            None => format!("{other:?}"),
        },
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "[{}]", self.type_tag)
        } else {
            write!(f, "[{}] {}", self.type_tag, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{pickler, unpickler};

    #[test]
    fn test_stop_iteration_family() {
        assert!(RemoteError::new("builtins.StopIteration", "").is_stop_iteration());
        assert!(RemoteError::new("exceptions.GeneratorExit", "").is_stop_iteration());
        assert!(RemoteError::new("StopIteration", "").is_stop_iteration());
        assert!(!RemoteError::new("shop.StopIteration", "").is_stop_iteration());
        assert!(!RemoteError::new("builtins.ValueError", "").is_stop_iteration());
    }

    #[test]
    fn test_traceback_list_is_joined() {
        let record = ClassDict::with_args("builtins.ValueError", vec![Value::from("bad value")]);
        let value = Value::object(record);
        if let Value::Object(record) = &value {
            record.write().fields.insert(
                TRACEBACK_ATTRIBUTE.into(),
                Value::list(vec![Value::from("line 1\n"), Value::from("line 2\n")]),
            );
        }
        let err = RemoteError::from_value(&value).expect("remote error");
        assert_eq!(err.type_tag, "builtins.ValueError");
        assert_eq!(err.message, "bad value");
        assert_eq!(err.traceback.as_deref(), Some("line 1\nline 2\n"));
        assert!(err.attributes.is_empty());
    }

    #[test]
    fn test_pickle_and_dict_forms_agree() {
        let mut err = RemoteError::new("Pyro4.errors.NamingError", "unknown name").with_traceback("tb");
        err.attributes.insert("code".into(), Value::Int(7));

        let bytes = pickler::dumps(&Value::native(err.clone()), 2).expect("pickle");
        let from_pickle = RemoteError::from_value(&unpickler::loads(&bytes).expect("unpickle"))
            .expect("from pickle");
        let from_dict = RemoteError::from_value(&err.to_dict()).expect("from dict");
        assert_eq!(from_pickle, err);
        assert_eq!(from_dict, err);
    }

    #[test]
    fn test_display() {
        let err = RemoteError::new("builtins.ZeroDivisionError", "division by zero");
        assert_eq!(err.to_string(), "[builtins.ZeroDivisionError] division by zero");
    }
}
