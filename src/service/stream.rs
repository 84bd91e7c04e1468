//! Remote iterators.
//!
//! A method that returns a generator answers with an ITEMSTREAMRESULT whose
//! `STRM` annotation names a stream held open by the daemon. Items are pulled
//! one call at a time with `get_next_stream_item`; the daemon signals the end
//! by raising StopIteration. Streams live on the connection that opened them,
//! so iteration never reconnects.

use crate::core::packet::MessageFlags;
use crate::core::value::Value;
use crate::error::constants::ERR_STREAM_CLOSED;
use crate::error::{ProtocolError, Result};
use crate::service::proxy::{PyroProxy, Reply};
use tracing::debug;

/// Id of a stream opened by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    id: String,
}

impl StreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Pulls items of one remote stream through the proxy that opened it.
///
/// Call [`close`](Self::close) when abandoning a stream early so the daemon
/// can release it.
#[derive(Debug)]
pub struct StreamIterator<'a> {
    proxy: &'a mut PyroProxy,
    handle: StreamHandle,
    exhausted: bool,
}

impl<'a> StreamIterator<'a> {
    pub(crate) fn new(proxy: &'a mut PyroProxy, handle: StreamHandle) -> Self {
        Self {
            proxy,
            handle,
            exhausted: false,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// The next item, or `None` once the daemon reports the end.
    ///
    /// Any other failure releases the stream, drops the connection and is
    /// returned.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if self.exhausted {
            return Ok(None);
        }
        if !self.proxy.is_connected() {
            self.exhausted = true;
            return Err(ProtocolError::Connection(ERR_STREAM_CLOSED.into()));
        }

        let id = Value::from(self.handle.id());
        match self
            .proxy
            .call_daemon("get_next_stream_item", &[id], MessageFlags::empty())
            .await
        {
            Ok(Reply::Value(item)) => Ok(Some(item)),
            Ok(Reply::Stream(nested)) => {
                self.fail().await;
                Err(ProtocolError::Protocol(format!(
                    "stream {} yielded nested stream {}",
                    self.handle.id(),
                    nested.id()
                )))
            }
            Err(ProtocolError::Remote(err)) if err.is_stop_iteration() => {
                debug!(stream = self.handle.id(), "Stream exhausted");
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => {
                self.fail().await;
                Err(e)
            }
        }
    }

    /// Drain the remaining items.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Tell the daemon to discard the stream. Failures are ignored.
    pub async fn close(mut self) {
        self.release().await;
    }

    async fn release(&mut self) {
        if self.exhausted {
            return;
        }
        self.exhausted = true;
        if !self.proxy.is_connected() {
            return;
        }
        let id = Value::from(self.handle.id());
        if let Err(e) = self
            .proxy
            .call_daemon("close_stream", &[id], MessageFlags::ONEWAY)
            .await
        {
            debug!(stream = self.handle.id(), error = %e, "close_stream failed");
        }
    }

    async fn fail(&mut self) {
        self.release().await;
        self.proxy.close();
    }
}
