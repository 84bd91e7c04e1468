//! Integration tests for envelope framing over byte streams
//!
//! These tests feed the envelope codec partial, concatenated and oversized
//! input the way a socket delivers it.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use pyro_wire::config::MAX_MESSAGE_SIZE;
use pyro_wire::core::codec::PacketCodec;
use pyro_wire::core::packet::{Annotations, ANNOTATION_CORRELATION, HEADER_SIZE};
use pyro_wire::error::ProtocolError;
use pyro_wire::{Message, MessageFlags, MessageType};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

fn message(seq: u32, payload: &[u8]) -> Message {
    let mut annotations = Annotations::new();
    annotations.insert(ANNOTATION_CORRELATION, vec![7u8; 16]);
    Message::new(
        MessageType::Invoke,
        payload.to_vec(),
        4,
        MessageFlags::empty(),
        seq,
    )
    .with_annotations(annotations)
}

fn encode(codec: &mut PacketCodec, msg: Message) -> BytesMut {
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf).unwrap();
    buf
}

#[test]
fn test_decode_consumes_exactly_one_frame() {
    let mut codec = PacketCodec::default();
    let mut buffer = encode(&mut codec, message(1, b"first"));
    buffer.extend_from_slice(&encode(&mut codec, message(2, b"second")));

    let first = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(first.seq, 1);
    assert_eq!(first.data, b"first");
    assert_eq!(
        first.annotations.get(&ANNOTATION_CORRELATION),
        Some(&[7u8; 16][..])
    );

    let second = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(second.seq, 2);
    assert_eq!(second.data, b"second");
    assert!(buffer.is_empty());
    assert!(codec.decode(&mut buffer).unwrap().is_none());
}

#[test]
fn test_decode_waits_for_header_and_body() {
    let key = b"key".as_slice();
    let mut codec = PacketCodec::new(Some(key), MAX_MESSAGE_SIZE);
    let full = encode(&mut codec, message(9, &[0xAB; 1000]));

    let mut buffer = BytesMut::new();
    // byte-by-byte through the header
    for &byte in &full[..HEADER_SIZE - 1] {
        buffer.extend_from_slice(&[byte]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }
    // header complete, body still partial
    buffer.extend_from_slice(&full[HEADER_SIZE - 1..full.len() - 1]);
    assert!(codec.decode(&mut buffer).unwrap().is_none());

    buffer.extend_from_slice(&full[full.len() - 1..]);
    let decoded = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(decoded.seq, 9);
    assert_eq!(decoded.data.len(), 1000);
    assert!(decoded.flags.contains(MessageFlags::HMAC));
}

#[test]
fn test_oversized_header_rejected_before_body_arrives() {
    let mut codec = PacketCodec::new(None, 1024);
    let mut sender = PacketCodec::default();
    let full = encode(&mut sender, message(1, &[0u8; 4096]));

    let mut buffer = BytesMut::from(&full[..HEADER_SIZE]);
    assert!(matches!(
        codec.decode(&mut buffer),
        Err(ProtocolError::OversizedMessage(_))
    ));
}

#[test]
fn test_encoder_refuses_oversized_message() {
    let mut codec = PacketCodec::new(None, 1024);
    let mut buf = BytesMut::new();
    assert!(matches!(
        codec.encode(message(1, &[0u8; 4096]), &mut buf),
        Err(ProtocolError::OversizedMessage(_))
    ));
    assert!(buf.is_empty());
}

#[test]
fn test_encoded_length_matches_header_fields() {
    let mut codec = PacketCodec::default();
    let msg = message(3, b"payload");
    let expected = msg.encoded_len();
    let buffer = encode(&mut codec, msg);
    assert_eq!(buffer.len(), expected);
    // data length and annotation length, big-endian
    assert_eq!(&buffer[14..18], &7u32.to_be_bytes());
    assert_eq!(&buffer[18..22], &24u32.to_be_bytes());
}

#[tokio::test]
async fn test_framed_stream_over_duplex_pipe() {
    let (client, server) = tokio::io::duplex(64);
    let key = b"pipe".as_slice();

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(client, PacketCodec::new(Some(key), MAX_MESSAGE_SIZE));
        for seq in 0..20u32 {
            let payload = vec![seq as u8; (seq as usize) * 97];
            sink.send(message(seq, &payload)).await.unwrap();
        }
    });

    let mut stream = FramedRead::new(server, PacketCodec::new(Some(key), MAX_MESSAGE_SIZE));
    for seq in 0..20u32 {
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.seq, seq);
        assert_eq!(msg.data.len(), (seq as usize) * 97);
    }
    writer.await.unwrap();
    assert!(stream.next().await.is_none());
}
