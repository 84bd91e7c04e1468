//! Connection handshake.
//!
//! The first message on a fresh connection is a CONNECT carrying
//! `{"handshake": <data>, "object": <object id>}` (the object id only when
//! metadata is requested, together with the META_ON_CONNECT flag). The
//! daemon answers with CONNECTOK or CONNECTFAIL. A CONNECTOK flagged
//! META_ON_CONNECT carries `{"handshake": <response>, "meta": <metadata>}`;
//! otherwise the payload is the handshake response itself. The response is
//! handed to a [`HandshakeValidator`] before the connection is accepted.

use crate::core::packet::{MessageFlags, MessageType};
use crate::core::value::{Key, Value};
use crate::error::constants::ERR_NO_EXPOSED_MEMBERS;
use crate::error::{ProtocolError, Result};
use crate::protocol::proxy_ref::names;
use std::collections::BTreeSet;
use tracing::debug;

/// Reason reported when the CONNECTOK payload cannot be decoded.
const UNDECODABLE_RESPONSE: &str = "<not available because unsupported serialization format>";

/// Exposed members of a remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub methods: BTreeSet<String>,
    pub attrs: BTreeSet<String>,
    pub oneway: BTreeSet<String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.attrs.is_empty()
    }

    /// Parse a `{"methods", "attrs", "oneways"}` mapping.
    ///
    /// An object that exposes neither methods nor attributes is an error.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !matches!(value, Value::Dict(_)) {
            return Err(ProtocolError::Protocol(format!(
                "metadata must be a dict, found {}",
                value.type_name()
            )));
        }
        let field = |name: &str| -> Result<BTreeSet<String>> {
            value.get_item(name).map_or(Ok(BTreeSet::new()), |v| names(&v))
        };
        let metadata = Self {
            methods: field("methods")?,
            attrs: field("attrs")?,
            oneway: field("oneways")?,
        };
        if metadata.is_empty() {
            return Err(ProtocolError::InvalidCall(ERR_NO_EXPOSED_MEMBERS.into()));
        }
        Ok(metadata)
    }
}

/// Decides whether a daemon's handshake response is acceptable.
pub trait HandshakeValidator: Send + Sync {
    fn validate(&self, response: &Value) -> Result<()>;
}

/// Accepts every response.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl HandshakeValidator for AcceptAll {
    fn validate(&self, _response: &Value) -> Result<()> {
        Ok(())
    }
}

impl<F> HandshakeValidator for F
where
    F: Fn(&Value) -> Result<()> + Send + Sync,
{
    fn validate(&self, response: &Value) -> Result<()> {
        self(response)
    }
}

/// CONNECT payload and flags.
pub fn connect_request(handshake: &Value, object_id: &str, metadata: bool) -> (Value, MessageFlags) {
    let mut entries = vec![(Key::from("handshake"), handshake.clone())];
    if metadata {
        entries.push((Key::from("object"), Value::from(object_id)));
    }
    let flags = if metadata {
        MessageFlags::META_ON_CONNECT
    } else {
        MessageFlags::empty()
    };
    (Value::dict(entries), flags)
}

/// Accepted handshake.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub response: Value,
    pub metadata: Option<Metadata>,
}

/// Interpret the daemon's answer to CONNECT.
///
/// `payload` is the decoded response, or the decode failure. Rejections and
/// validator refusals are [`ProtocolError::HandshakeError`].
pub fn interpret_response(
    msg_type: MessageType,
    flags: MessageFlags,
    payload: Result<Value>,
    validator: &dyn HandshakeValidator,
) -> Result<Accepted> {
    let (msg_type, payload) = match payload {
        Ok(value) => (msg_type, value),
        Err(e) => {
            debug!(error = %e, "Handshake response could not be decoded");
            (MessageType::ConnectFail, Value::from(UNDECODABLE_RESPONSE))
        }
    };

    match msg_type {
        MessageType::ConnectOk => {
            let (response, metadata) = if flags.contains(MessageFlags::META_ON_CONNECT) {
                let meta = payload.get_item("meta").ok_or_else(|| {
                    ProtocolError::HandshakeError("response carries no metadata".into())
                })?;
                let response = payload.get_item("handshake").unwrap_or(Value::None);
                (response, Some(Metadata::from_value(&meta)?))
            } else {
                (payload, None)
            };
            validator
                .validate(&response)
                .map_err(|e| ProtocolError::HandshakeError(format!("handshake rejected: {e}")))?;
            Ok(Accepted { response, metadata })
        }
        MessageType::ConnectFail => {
            let reason = payload
                .as_str()
                .map_or_else(|| format!("{payload:?}"), str::to_string);
            Err(ProtocolError::HandshakeError(format!(
                "connection rejected, reason: {reason}"
            )))
        }
        other => Err(ProtocolError::Protocol(format!(
            "connect: invalid msg type {} received",
            other as u8
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Value {
        Value::dict([
            (Key::from("methods"), Value::set([Key::from("add")])),
            (Key::from("attrs"), Value::list(vec![Value::from("size")])),
            (Key::from("oneways"), Value::tuple(vec![Value::from("notify")])),
        ])
    }

    #[test]
    fn test_connect_request() {
        let (payload, flags) = connect_request(&Value::from("hello"), "thing", true);
        assert_eq!(flags, MessageFlags::META_ON_CONNECT);
        assert_eq!(payload.get_item("object"), Some(Value::from("thing")));

        let (payload, flags) = connect_request(&Value::from("hello"), "thing", false);
        assert!(flags.is_empty());
        assert_eq!(payload.get_item("object"), None);
    }

    #[test]
    fn test_metadata_on_connect() {
        let payload = Value::dict([
            (Key::from("handshake"), Value::from("hi")),
            (Key::from("meta"), meta()),
        ]);
        let accepted = interpret_response(
            MessageType::ConnectOk,
            MessageFlags::META_ON_CONNECT,
            Ok(payload),
            &AcceptAll,
        )
        .expect("accepted");
        let metadata = accepted.metadata.expect("metadata");
        assert!(metadata.methods.contains("add"));
        assert!(metadata.attrs.contains("size"));
        assert!(metadata.oneway.contains("notify"));
        assert_eq!(accepted.response, Value::from("hi"));
    }

    #[test]
    fn test_rejections() {
        let err = interpret_response(
            MessageType::ConnectFail,
            MessageFlags::empty(),
            Ok(Value::from("go away")),
            &AcceptAll,
        )
        .expect_err("rejected");
        assert!(err.to_string().contains("go away"));

        let refuse = |_: &Value| -> Result<()> { Err(ProtocolError::InvalidCall("nope".into())) };
        assert!(matches!(
            interpret_response(MessageType::ConnectOk, MessageFlags::empty(), Ok(Value::None), &refuse),
            Err(ProtocolError::HandshakeError(_))
        ));

        assert!(matches!(
            interpret_response(
                MessageType::ConnectOk,
                MessageFlags::empty(),
                Err(ProtocolError::UnsupportedSerializer(9)),
                &AcceptAll
            ),
            Err(ProtocolError::HandshakeError(_))
        ));
    }

    #[test]
    fn test_empty_metadata_rejected() {
        assert!(Metadata::from_value(&Value::dict(Vec::new())).is_err());
    }
}
