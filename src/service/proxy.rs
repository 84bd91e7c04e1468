//! # Remote Proxy
//!
//! [`PyroProxy`] owns one connection to a Pyro daemon and turns method calls
//! into INVOKE envelopes.
//!
//! ## Lifecycle
//! A proxy starts disconnected. The first call opens the TCP connection and
//! performs the CONNECT handshake, optionally receiving the object's
//! metadata; when the daemon does not include it, `get_metadata` is asked
//! for separately. Sequence numbers restart at zero on every connection and
//! wrap at 16 bits.
//!
//! ## Failures
//! - Connection-level errors drop the connection; the call is retried once
//!   on a fresh connection before the error is returned.
//! - Protocol, authentication and handshake errors drop the connection and
//!   are returned immediately.
//! - Remote exceptions are returned as [`ProtocolError::Remote`]; the
//!   connection stays usable.
//!
//! A proxy is not meant to be shared between tasks; use one proxy per task or
//! wrap it in a lock.

use crate::config::{ClientConfig, PyroConfig, DAEMON_NAME};
use crate::core::packet::{
    annotation_tag, Annotations, Message, MessageFlags, MessageType, ANNOTATION_CORRELATION,
    ANNOTATION_STREAM,
};
use crate::core::serialization::{Kwargs, SerializerRegistry};
use crate::core::unpickler::default_registry;
use crate::core::value::Value;
use crate::error::constants::{ERR_CALL_ATTRIBUTE, ERR_NOT_CONNECTED, ERR_STREAM_NOT_ALLOWED};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{self, AcceptAll, HandshakeValidator, Metadata};
use crate::protocol::proxy_ref::ProxyRef;
use crate::protocol::remote_error::RemoteError;
use crate::protocol::uri::PyroUri;
use crate::service::connection::Connection;
use crate::service::stream::{StreamHandle, StreamIterator};
use crate::utils::compression::{decompress_with_limit, maybe_compress};
use crate::utils::metrics::{global_metrics, Metrics, Timer};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Outcome of a blocking call.
#[derive(Debug)]
pub enum Reply {
    Value(Value),
    /// The method returned an iterator; pull it with [`PyroProxy::stream`].
    Stream(StreamHandle),
}

impl Reply {
    /// The returned value, or an error if the method returned a stream.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Reply::Value(value) => Ok(value),
            Reply::Stream(handle) => Err(ProtocolError::InvalidCall(format!(
                "call returned stream {}; iterate it through the proxy",
                handle.id()
            ))),
        }
    }
}

pub struct PyroProxy {
    uri: PyroUri,
    config: ClientConfig,
    serializers: Arc<SerializerRegistry>,
    connection: Option<Connection>,
    seq: u16,
    metadata: Metadata,
    handshake: Value,
    handshake_response: Option<Value>,
    validator: Arc<dyn HandshakeValidator>,
    correlation_id: Option<Uuid>,
    annotations: Annotations,
    response_annotations: Annotations,
}

impl PyroProxy {
    pub fn new(uri: PyroUri, config: ClientConfig, serializers: Arc<SerializerRegistry>) -> Self {
        let handshake = Value::from(config.handshake.as_str());
        Self {
            uri,
            config,
            serializers,
            connection: None,
            seq: 0,
            metadata: Metadata::default(),
            handshake,
            handshake_response: None,
            validator: Arc::new(AcceptAll),
            correlation_id: None,
            annotations: Annotations::new(),
            response_annotations: Annotations::new(),
        }
    }

    /// Proxy for `uri` using the client and serializer sections of `config`.
    pub fn from_config(uri: &str, config: &PyroConfig) -> Result<Self> {
        let serializers = SerializerRegistry::from_config(&config.serializer, default_registry())?;
        Ok(Self::new(
            PyroUri::parse(uri)?,
            config.client.clone(),
            Arc::new(serializers),
        ))
    }

    /// Proxy for a descriptor received from a daemon, reusing its metadata.
    pub fn from_ref(proxy: &ProxyRef, config: ClientConfig, serializers: Arc<SerializerRegistry>) -> Self {
        let mut this = Self::new(proxy.uri.clone(), config, serializers);
        this.metadata = Metadata {
            methods: proxy.methods.clone(),
            attrs: proxy.attrs.clone(),
            oneway: proxy.oneway.clone(),
        };
        this.handshake = proxy.handshake.clone();
        this
    }

    pub fn with_validator<V: HandshakeValidator + 'static>(mut self, validator: V) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_handshake(mut self, handshake: Value) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn uri(&self) -> &PyroUri {
        &self.uri
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Process-wide client counters.
    pub fn metrics(&self) -> &'static Metrics {
        global_metrics()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The daemon's answer to the last handshake.
    pub fn handshake_response(&self) -> Option<&Value> {
        self.handshake_response.as_ref()
    }

    /// Sent as the 16-byte `CORR` annotation on every message.
    pub fn set_correlation_id(&mut self, id: Option<Uuid>) {
        self.correlation_id = id;
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Attach a custom annotation to every outgoing message.
    pub fn set_annotation(&mut self, tag: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.annotations.insert(annotation_tag(tag)?, value.into());
        Ok(())
    }

    /// Annotations of the most recent response (or handshake answer).
    pub fn last_response_annotations(&self) -> &Annotations {
        &self.response_annotations
    }

    /// Open the connection and handshake now instead of on the first call.
    pub async fn connect(&mut self) -> Result<()> {
        self.ensure_connected().await.map_err(|e| {
            global_metrics().record_error(&e);
            e
        })
    }

    /// Drop the connection; the next call reconnects.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!(uri = %self.uri, "Proxy connection closed");
        }
    }

    pub async fn call_method(&mut self, method: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Reply> {
        self.internal_call(method, None, MessageFlags::empty(), true, &args, &kwargs)
            .await
    }

    /// Call `method` and return its value; a returned stream is drained into a list.
    pub async fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value> {
        match self.call_method(method, args, Kwargs::new()).await? {
            Reply::Value(value) => Ok(value),
            Reply::Stream(handle) => {
                let items = self.stream(handle).collect().await?;
                Ok(Value::list(items))
            }
        }
    }

    /// Call `method` without waiting for (or reading) a response.
    pub async fn call_oneway(&mut self, method: &str, args: Vec<Value>) -> Result<()> {
        self.internal_call(method, None, MessageFlags::ONEWAY, true, &args, &Kwargs::new())
            .await
            .map(|_| ())
    }

    pub async fn get_attribute(&mut self, name: &str) -> Result<Value> {
        self.internal_call(
            "__getattr__",
            None,
            MessageFlags::empty(),
            false,
            &[Value::from(name)],
            &Kwargs::new(),
        )
        .await?
        .into_value()
    }

    pub async fn set_attribute(&mut self, name: &str, value: Value) -> Result<()> {
        self.internal_call(
            "__setattr__",
            None,
            MessageFlags::empty(),
            false,
            &[Value::from(name), value],
            &Kwargs::new(),
        )
        .await
        .map(|_| ())
    }

    /// Iterate a stream returned by [`call_method`](Self::call_method).
    pub fn stream(&mut self, handle: StreamHandle) -> StreamIterator<'_> {
        StreamIterator::new(self, handle)
    }

    #[instrument(skip(self, args, kwargs), fields(uri = %self.uri), level = "debug")]
    async fn internal_call(
        &mut self,
        method: &str,
        object: Option<&str>,
        flags: MessageFlags,
        check_method_name: bool,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Reply> {
        let _timer = Timer::start("remote_call");
        let mut reconnected = false;
        loop {
            let result = match self.ensure_connected().await {
                Ok(()) => {
                    self.invoke(method, object, flags, check_method_name, args, kwargs)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_retryable() && !reconnected => {
                    warn!(error = %e, method, "Connection failed, reconnecting once");
                    self.close();
                    global_metrics().reconnect();
                    reconnected = true;
                }
                Err(e) => {
                    if e.closes_connection() {
                        self.close();
                    }
                    global_metrics().record_error(&e);
                    return Err(e);
                }
                Ok(reply) => return Ok(reply),
            }
        }
    }

    /// Call a daemon method on the current connection without reconnecting.
    pub(crate) async fn call_daemon(
        &mut self,
        method: &str,
        args: &[Value],
        flags: MessageFlags,
    ) -> Result<Reply> {
        if self.connection.is_none() {
            return Err(ProtocolError::Connection(ERR_NOT_CONNECTED.into()));
        }
        let result = self
            .invoke(method, Some(DAEMON_NAME), flags, false, args, &Kwargs::new())
            .await;
        if let Err(e) = &result {
            if e.closes_connection() {
                self.close();
            }
            global_metrics().record_error(e);
        }
        result
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let mut conn = Connection::connect(&self.uri, &self.config).await?;
        self.seq = 0;
        global_metrics().handshake_attempt();
        if let Err(e) = self.handshake(&mut conn).await {
            global_metrics().handshake_failed();
            return Err(e);
        }
        self.connection = Some(conn);
        info!(uri = %self.uri, "Proxy connected");

        if self.config.metadata && self.metadata.is_empty() {
            if let Err(e) = self.fetch_metadata().await {
                warn!(uri = %self.uri, error = %e, "Metadata fetch failed");
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn handshake(&mut self, conn: &mut Connection) -> Result<()> {
        let serializers = Arc::clone(&self.serializers);
        let serializer = serializers.preferred()?;
        let (payload, flags) =
            handshake::connect_request(&self.handshake, &self.uri.object_id, self.config.metadata);
        let data = serializer.serialize_data(&payload)?;
        let msg = Message::new(
            MessageType::Connect,
            data,
            serializer.id().as_u16(),
            flags,
            u32::from(self.seq),
        )
        .with_annotations(self.outgoing_annotations());
        conn.send(msg).await?;

        let response = conn
            .recv_expecting(&[MessageType::ConnectOk, MessageType::ConnectFail])
            .await?;
        if response.seq != u32::from(self.seq) {
            return Err(ProtocolError::SequenceMismatch {
                expected: u32::from(self.seq),
                received: response.seq,
            });
        }
        self.response_annotations = response.annotations.clone();
        let decoded = self.inflate(&response).and_then(|data| {
            serializers
                .get_raw(response.serializer_id)?
                .deserialize_data(&data)
        });
        let accepted = handshake::interpret_response(
            response.msg_type,
            response.flags,
            decoded,
            self.validator.as_ref(),
        )?;
        if let Some(metadata) = accepted.metadata {
            self.metadata = metadata;
        }
        self.handshake_response = Some(accepted.response);
        Ok(())
    }

    async fn fetch_metadata(&mut self) -> Result<()> {
        let object_id = Value::from(self.uri.object_id.as_str());
        let reply = self
            .invoke(
                "get_metadata",
                Some(DAEMON_NAME),
                MessageFlags::empty(),
                false,
                &[object_id],
                &Kwargs::new(),
            )
            .await?;
        match reply {
            Reply::Value(Value::None) => Ok(()),
            Reply::Value(value) => {
                self.metadata = Metadata::from_value(&value)?;
                debug!(
                    methods = self.metadata.methods.len(),
                    attrs = self.metadata.attrs.len(),
                    oneway = self.metadata.oneway.len(),
                    "Metadata received"
                );
                Ok(())
            }
            Reply::Stream(_) => Err(ProtocolError::Protocol("metadata returned as a stream".into())),
        }
    }

    /// Send one INVOKE on the current connection and read its answer.
    async fn invoke(
        &mut self,
        method: &str,
        object: Option<&str>,
        mut flags: MessageFlags,
        check_method_name: bool,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Reply> {
        let object_id = object.unwrap_or(&self.uri.object_id).to_string();
        if self.metadata.attrs.contains(method) {
            return Err(ProtocolError::InvalidCall(ERR_CALL_ATTRIBUTE.into()));
        }
        if self.metadata.oneway.contains(method) {
            flags |= MessageFlags::ONEWAY;
        }
        if check_method_name && self.config.metadata && !self.metadata.methods.contains(method) {
            return Err(ProtocolError::InvalidCall(format!(
                "remote object '{object_id}' has no exposed attribute or method '{method}'"
            )));
        }

        let serializers = Arc::clone(&self.serializers);
        let serializer = serializers.preferred()?;
        let payload = serializer.serialize_call(&object_id, method, args, kwargs)?;
        let (data, compressed) = if self.config.compression {
            maybe_compress(&payload, self.config.compression_threshold_bytes)?
        } else {
            (payload, false)
        };
        if compressed {
            flags |= MessageFlags::COMPRESSED;
        }

        self.seq = self.seq.wrapping_add(1);
        let seq = u32::from(self.seq);
        let msg = Message::new(MessageType::Invoke, data, serializer.id().as_u16(), flags, seq)
            .with_annotations(self.outgoing_annotations());
        let oneway = flags.contains(MessageFlags::ONEWAY);

        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| ProtocolError::Connection(ERR_NOT_CONNECTED.into()))?;
        conn.send(msg).await?;
        global_metrics().call(oneway);
        debug!(method, seq, oneway, "Call sent");
        if oneway {
            return Ok(Reply::Value(Value::None));
        }

        let response = conn
            .recv_expecting(&[MessageType::Result, MessageType::Exception])
            .await?;
        self.process_response(response, seq)
    }

    fn process_response(&mut self, response: Message, seq: u32) -> Result<Reply> {
        if response.seq != seq {
            return Err(ProtocolError::SequenceMismatch {
                expected: seq,
                received: response.seq,
            });
        }
        self.response_annotations = response.annotations.clone();
        let data = self.inflate(&response)?;

        if response.flags.contains(MessageFlags::ITEMSTREAMRESULT) {
            let id = response
                .annotations
                .get(&ANNOTATION_STREAM)
                .ok_or_else(|| ProtocolError::InvalidCall(ERR_STREAM_NOT_ALLOWED.into()))?;
            return Ok(Reply::Stream(StreamHandle::new(String::from_utf8_lossy(id))));
        }

        let value = self
            .serializers
            .get_raw(response.serializer_id)?
            .deserialize_data(&data)?;
        if response.flags.contains(MessageFlags::EXCEPTION) || response.msg_type == MessageType::Exception {
            let err = RemoteError::from_value(&value)?;
            debug!(error = %err, "Remote call raised");
            return Err(err.into());
        }
        Ok(Reply::Value(value))
    }

    fn inflate(&self, msg: &Message) -> Result<Vec<u8>> {
        if msg.flags.contains(MessageFlags::COMPRESSED) {
            decompress_with_limit(&msg.data, self.config.max_message_size)
        } else {
            Ok(msg.data.clone())
        }
    }

    fn outgoing_annotations(&self) -> Annotations {
        let mut annotations = self.annotations.clone();
        if let Some(id) = self.correlation_id {
            annotations.insert(ANNOTATION_CORRELATION, id.as_bytes().to_vec());
        }
        annotations
    }
}

impl fmt::Debug for PyroProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PyroProxy")
            .field("uri", &self.uri.to_string())
            .field("connected", &self.connection.is_some())
            .field("seq", &self.seq)
            .field("metadata", &self.metadata)
            .field("serializer", &self.serializers.preferred_id())
            .finish()
    }
}
