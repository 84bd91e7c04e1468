//! # Message Envelope
//!
//! The framed unit exchanged with a Pyro daemon: a fixed 56-byte header,
//! a block of annotations and the serialized payload.
//!
//! ## Wire Format
//! ```text
//! 0..4   magic "PYRO"
//! 4      protocol version
//! 5      message type
//! 6..8   flags
//! 8..10  serializer id
//! 10..14 sequence number
//! 14..18 payload length
//! 18..22 annotations length
//! 22..24 reserved
//! 24..56 HMAC-SHA256 digest (zero when no key is configured)
//! ```
//! All integers are big-endian. Each annotation is a 4-byte ASCII tag, a
//! 4-byte length and the value bytes. Annotations keep their insertion order
//! and unknown tags are carried through untouched.
//!
//! ## Authentication
//! The digest covers the header (with the digest field zeroed), the
//! annotation block and the payload. It is verified in constant time. A
//! message flagged as authenticated arriving at a peer without a key, or the
//! reverse, is rejected as an authentication error.

use crate::config::{MAGIC_BYTES, PROTOCOL_VERSION};
use crate::error::constants::{ERR_HMAC_ASYMMETRIC, ERR_HMAC_MISMATCH};
use crate::error::{ProtocolError, Result};
use bitflags::bitflags;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 56;

/// Size of the HMAC-SHA256 digest field
pub const DIGEST_SIZE: usize = 32;

const DIGEST_OFFSET: usize = 24;

/// Annotation carrying the caller's correlation id (16 bytes)
pub const ANNOTATION_CORRELATION: [u8; 4] = *b"CORR";

/// Annotation carrying the id of a server-side item stream
pub const ANNOTATION_STREAM: [u8; 4] = *b"STRM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnectOk = 2,
    ConnectFail = 3,
    Invoke = 4,
    Result = 5,
    Ping = 6,
    Exception = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Connect,
            2 => MessageType::ConnectOk,
            3 => MessageType::ConnectFail,
            4 => MessageType::Invoke,
            5 => MessageType::Result,
            6 => MessageType::Ping,
            7 => MessageType::Exception,
            other => {
                return Err(ProtocolError::Protocol(format!(
                    "invalid msg type {other} received"
                )))
            }
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u16 {
        const EXCEPTION = 1 << 0;
        const COMPRESSED = 1 << 1;
        const ONEWAY = 1 << 2;
        const BATCH = 1 << 3;
        const META_ON_CONNECT = 1 << 4;
        const ITEMSTREAMRESULT = 1 << 5;
        const KEEPSERIALIZED = 1 << 6;
        const HMAC = 1 << 7;
    }
}

/// One annotation chunk.
#[derive(Clone, PartialEq, Eq)]
pub struct Annotation {
    pub tag: [u8; 4],
    pub value: Vec<u8>,
}

impl fmt::Debug for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({} bytes)",
            String::from_utf8_lossy(&self.tag),
            self.value.len()
        )
    }
}

/// Ordered annotation chunks; inserting an existing tag replaces it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations(Vec<Annotation>);

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: [u8; 4], value: Vec<u8>) {
        match self.0.iter_mut().find(|a| a.tag == tag) {
            Some(existing) => existing.value = value,
            None => self.0.push(Annotation { tag, value }),
        }
    }

    pub fn get(&self, tag: &[u8; 4]) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|a| &a.tag == tag)
            .map(|a| a.value.as_slice())
    }

    pub fn remove(&mut self, tag: &[u8; 4]) -> Option<Vec<u8>> {
        let index = self.0.iter().position(|a| &a.tag == tag)?;
        Some(self.0.remove(index).value)
    }

    pub fn contains(&self, tag: &[u8; 4]) -> bool {
        self.get(tag).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes the annotation block occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(|a| 8 + a.value.len()).sum()
    }

    pub fn extend(&mut self, other: &Annotations) {
        for a in other.iter() {
            self.insert(a.tag, a.value.clone());
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for a in &self.0 {
            out.extend_from_slice(&a.tag);
            out.extend_from_slice(&(a.value.len() as u32).to_be_bytes());
            out.extend_from_slice(&a.value);
        }
    }

    /// Parse an annotation block that must be consumed exactly.
    pub fn parse(mut block: &[u8]) -> Result<Self> {
        let mut annotations = Annotations::new();
        while !block.is_empty() {
            if block.len() < 8 {
                return Err(ProtocolError::Protocol("truncated annotation chunk header".into()));
            }
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&block[..4]);
            let len = u32::from_be_bytes([block[4], block[5], block[6], block[7]]) as usize;
            let rest = &block[8..];
            if rest.len() < len {
                return Err(ProtocolError::LengthMismatch {
                    declared: len,
                    actual: rest.len(),
                });
            }
            annotations.0.push(Annotation {
                tag,
                value: rest[..len].to_vec(),
            });
            block = &rest[len..];
        }
        Ok(annotations)
    }
}

/// Turn a string tag into the 4-byte wire form.
pub fn annotation_tag(tag: &str) -> Result<[u8; 4]> {
    let bytes: [u8; 4] = tag
        .as_bytes()
        .try_into()
        .map_err(|_| ProtocolError::InvalidCall(format!("annotation key must be length 4: {tag:?}")))?;
    if !bytes.iter().all(u8::is_ascii) {
        return Err(ProtocolError::InvalidCall(format!(
            "annotation key must be ascii: {tag:?}"
        )));
    }
    Ok(bytes)
}

/// Fields of a parsed header, before the body has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub serializer_id: u16,
    pub seq: u32,
    pub data_size: usize,
    pub annotations_size: usize,
    pub digest: [u8; DIGEST_SIZE],
}

impl MessageHeader {
    /// Validate magic, version, type and size limit of a header.
    pub fn parse(header: &[u8], max_message_size: usize) -> Result<Self> {
        if header.len() < HEADER_SIZE {
            return Err(ProtocolError::LengthMismatch {
                declared: HEADER_SIZE,
                actual: header.len(),
            });
        }
        if header[0..4] != MAGIC_BYTES {
            return Err(ProtocolError::InvalidHeader);
        }
        if header[4] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header[4]));
        }
        let msg_type = MessageType::try_from(header[5])?;
        let flags = MessageFlags::from_bits_retain(u16::from_be_bytes([header[6], header[7]]));
        let serializer_id = u16::from_be_bytes([header[8], header[9]]);
        let seq = u32::from_be_bytes([header[10], header[11], header[12], header[13]]);
        let data_size = u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
        let annotations_size =
            u32::from_be_bytes([header[18], header[19], header[20], header[21]]) as usize;

        let body = data_size.saturating_add(annotations_size);
        if body > max_message_size {
            return Err(ProtocolError::OversizedMessage(body));
        }

        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&header[DIGEST_OFFSET..HEADER_SIZE]);

        Ok(Self {
            msg_type,
            flags,
            serializer_id,
            seq,
            data_size,
            annotations_size,
            digest,
        })
    }

    /// Header, annotations and payload length together.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.annotations_size + self.data_size
    }
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub serializer_id: u16,
    pub seq: u32,
    pub annotations: Annotations,
    pub data: Vec<u8>,
    digest: [u8; DIGEST_SIZE],
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        data: Vec<u8>,
        serializer_id: u16,
        flags: MessageFlags,
        seq: u32,
    ) -> Self {
        Self {
            msg_type,
            flags,
            serializer_id,
            seq,
            annotations: Annotations::new(),
            data,
            digest: [0u8; DIGEST_SIZE],
        }
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    /// The digest currently carried in the header.
    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Set or clear the HMAC flag and digest for `key`.
    pub fn sign(&mut self, key: Option<&[u8]>) -> Result<()> {
        self.digest = [0u8; DIGEST_SIZE];
        match key {
            Some(key) => {
                self.flags.insert(MessageFlags::HMAC);
                let mac = self.mac(key)?;
                self.digest.copy_from_slice(&mac.finalize().into_bytes());
            }
            None => self.flags.remove(MessageFlags::HMAC),
        }
        Ok(())
    }

    /// Check the digest against `key` in constant time.
    pub fn verify(&self, key: Option<&[u8]>) -> Result<()> {
        let flagged = self.flags.contains(MessageFlags::HMAC);
        match (key, flagged) {
            (None, false) => Ok(()),
            (Some(key), true) => self
                .mac(key)?
                .verify_slice(&self.digest)
                .map_err(|_| ProtocolError::Authentication(ERR_HMAC_MISMATCH.into())),
            _ => Err(ProtocolError::Authentication(ERR_HMAC_ASYMMETRIC.into())),
        }
    }

    fn mac(&self, key: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| ProtocolError::Authentication(format!("invalid hmac key: {e}")))?;
        mac.update(&self.header_with_digest([0u8; DIGEST_SIZE]));
        mac.update(&self.annotation_bytes());
        mac.update(&self.data);
        Ok(mac)
    }

    fn header_with_digest(&self, digest: [u8; DIGEST_SIZE]) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC_BYTES);
        header[4] = PROTOCOL_VERSION;
        header[5] = self.msg_type as u8;
        header[6..8].copy_from_slice(&self.flags.bits().to_be_bytes());
        header[8..10].copy_from_slice(&self.serializer_id.to_be_bytes());
        header[10..14].copy_from_slice(&self.seq.to_be_bytes());
        header[14..18].copy_from_slice(&(self.data.len() as u32).to_be_bytes());
        header[18..22].copy_from_slice(&(self.annotations.encoded_len() as u32).to_be_bytes());
        header[DIGEST_OFFSET..HEADER_SIZE].copy_from_slice(&digest);
        header
    }

    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        self.header_with_digest(self.digest)
    }

    pub fn annotation_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.annotations.encoded_len());
        self.annotations.write_to(&mut out);
        out
    }

    /// Total size on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.annotations.encoded_len() + self.data.len()
    }

    /// Serialize header, annotations and payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.header_bytes());
        self.annotations.write_to(&mut out);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse and authenticate one complete message.
    ///
    /// `bytes` must hold exactly one message; any shortfall or surplus is a
    /// [`ProtocolError::LengthMismatch`].
    pub fn from_bytes(bytes: &[u8], key: Option<&[u8]>, max_message_size: usize) -> Result<Self> {
        let header = MessageHeader::parse(bytes, max_message_size)?;
        let actual = bytes.len() - HEADER_SIZE;
        let declared = header.annotations_size + header.data_size;
        if actual != declared {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        let annotations_end = HEADER_SIZE + header.annotations_size;
        let annotation_block = &bytes[HEADER_SIZE..annotations_end];
        let data = &bytes[annotations_end..];

        verify_raw(&bytes[..HEADER_SIZE], annotation_block, data, &header, key)?;

        Ok(Self {
            msg_type: header.msg_type,
            flags: header.flags,
            serializer_id: header.serializer_id,
            seq: header.seq,
            annotations: Annotations::parse(annotation_block)?,
            data: data.to_vec(),
            digest: header.digest,
        })
    }
}

// Authenticates the bytes exactly as received, before the annotations are parsed.
fn verify_raw(
    header_bytes: &[u8],
    annotation_block: &[u8],
    data: &[u8],
    header: &MessageHeader,
    key: Option<&[u8]>,
) -> Result<()> {
    let flagged = header.flags.contains(MessageFlags::HMAC);
    match (key, flagged) {
        (None, false) => Ok(()),
        (Some(key), true) => {
            let mut zeroed = [0u8; HEADER_SIZE];
            zeroed[..DIGEST_OFFSET].copy_from_slice(&header_bytes[..DIGEST_OFFSET]);
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|e| ProtocolError::Authentication(format!("invalid hmac key: {e}")))?;
            mac.update(&zeroed);
            mac.update(annotation_block);
            mac.update(data);
            mac.verify_slice(&header.digest)
                .map_err(|_| ProtocolError::Authentication(ERR_HMAC_MISMATCH.into()))
        }
        _ => Err(ProtocolError::Authentication(ERR_HMAC_ASYMMETRIC.into())),
    }
}
