//! # Envelope Codec
//!
//! `tokio_util::codec` framing for [`Message`] over a byte stream.
//!
//! The decoder waits for a full 56-byte header, validates it, then waits for
//! the declared annotation and payload bytes before handing the whole frame to
//! [`Message::from_bytes`]. Oversized frames are rejected from the header
//! alone, before any body bytes are buffered. The encoder signs each message
//! with the configured key (or clears the HMAC flag when there is none).

use crate::config::MAX_MESSAGE_SIZE;
use crate::core::packet::{Message, MessageHeader, HEADER_SIZE};
use crate::error::{ProtocolError, Result};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone)]
pub struct PacketCodec {
    hmac_key: Option<Arc<[u8]>>,
    max_message_size: usize,
}

impl PacketCodec {
    pub fn new(hmac_key: Option<&[u8]>, max_message_size: usize) -> Self {
        Self {
            hmac_key: hmac_key.map(Arc::from),
            max_message_size,
        }
    }

    pub fn hmac_key(&self) -> Option<&[u8]> {
        self.hmac_key.as_deref()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(None, MAX_MESSAGE_SIZE)
    }
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("hmac", &self.hmac_key.is_some())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl Decoder for PacketCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let header = MessageHeader::parse(&src[..HEADER_SIZE], self.max_message_size)?;
        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        Message::from_bytes(&frame, self.hmac_key(), self.max_message_size).map(Some)
    }
}

impl Encoder<Message> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, mut item: Message, dst: &mut BytesMut) -> Result<()> {
        let body = item.annotations.encoded_len() + item.data.len();
        if body > self.max_message_size {
            return Err(ProtocolError::OversizedMessage(body));
        }
        item.sign(self.hmac_key())?;
        dst.reserve(HEADER_SIZE + body);
        dst.put_slice(&item.header_bytes());
        dst.put_slice(&item.annotation_bytes());
        dst.put_slice(&item.data);
        Ok(())
    }
}
