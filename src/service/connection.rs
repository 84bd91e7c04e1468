use crate::config::ClientConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::{Message, MessageFlags, MessageType};
use crate::error::{ProtocolError, Result};
use crate::protocol::uri::PyroUri;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;
use crate::utils::trace::{maybe_trace, Direction};

use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// One TCP connection to a daemon, framed as Pyro envelopes.
pub struct Connection {
    framed: Framed<TcpStream, PacketCodec>,
    send_timeout: Duration,
    recv_timeout: Duration,
    trace_dir: Option<PathBuf>,
    last_activity: Instant,
}

impl Connection {
    #[instrument(skip(uri, config), fields(uri = %uri), level = "debug")]
    pub async fn connect(uri: &PyroUri, config: &ClientConfig) -> Result<Self> {
        if uri.sockname.is_some() {
            return Err(ProtocolError::Connection(format!(
                "unix socket locations are not supported: {uri}"
            )));
        }
        if uri.host.is_empty() {
            return Err(ProtocolError::Connection(format!(
                "{uri} has no network location; resolve it through a name server first"
            )));
        }

        let addr = uri.socket_addr();
        let stream = with_timeout_error(
            async { TcpStream::connect(&addr).await.map_err(ProtocolError::from) },
            config.connection_timeout,
        )
        .await?;
        stream.set_nodelay(config.tcp_nodelay)?;

        let key = config.hmac_key_bytes();
        let codec = PacketCodec::new(key.as_deref(), config.max_message_size);
        debug!(%addr, hmac = key.is_some(), "Connected to daemon");

        Ok(Self::from_framed(Framed::new(stream, codec), config))
    }

    pub fn from_framed(framed: Framed<TcpStream, PacketCodec>, config: &ClientConfig) -> Self {
        global_metrics().connection_established();
        Self {
            framed,
            send_timeout: config.send_timeout,
            recv_timeout: config.response_timeout,
            trace_dir: config.msg_trace_dir.as_ref().map(PathBuf::from),
            last_activity: Instant::now(),
        }
    }

    /// Set custom timeout durations
    pub fn with_timeouts(mut self, send_timeout: Duration, recv_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.recv_timeout = recv_timeout;
        self
    }

    /// Get the time since the last activity (send or receive)
    pub fn time_since_last_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn update_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    #[instrument(skip(self, msg), fields(seq = msg.seq, msg_type = ?msg.msg_type), level = "debug")]
    pub async fn send(&mut self, mut msg: Message) -> Result<()> {
        // sign here so the trace shows the header that goes on the wire
        msg.sign(self.framed.codec().hmac_key())?;
        maybe_trace(self.trace_dir.as_deref(), &msg, Direction::Send).await;

        let size = msg.encoded_len() as u64;
        let compressed = msg.flags.contains(MessageFlags::COMPRESSED);
        with_timeout_error(
            async {
                self.framed.send(msg).await?;
                Ok(())
            },
            self.send_timeout,
        )
        .await?;

        global_metrics().message_sent(size, compressed);
        self.update_activity();
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn recv(&mut self) -> Result<Message> {
        let msg = with_timeout_error(
            async {
                let msg = self
                    .framed
                    .next()
                    .await
                    .ok_or(ProtocolError::ConnectionClosed)??;
                Ok(msg)
            },
            self.recv_timeout,
        )
        .await?;

        maybe_trace(self.trace_dir.as_deref(), &msg, Direction::Recv).await;
        global_metrics().message_received(msg.encoded_len() as u64);
        self.update_activity();
        Ok(msg)
    }

    /// Receive one message, which must be one of `accepted`.
    pub async fn recv_expecting(&mut self, accepted: &[MessageType]) -> Result<Message> {
        let msg = self.recv().await?;
        if !accepted.contains(&msg.msg_type) {
            return Err(ProtocolError::Protocol(format!(
                "invalid msg type {} received",
                msg.msg_type as u8
            )));
        }
        Ok(msg)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        global_metrics().connection_closed();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("codec", self.framed.codec())
            .field("idle", &self.last_activity.elapsed())
            .finish()
    }
}
