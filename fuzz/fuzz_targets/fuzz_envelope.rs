#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use pyro_wire::core::codec::PacketCodec;
use pyro_wire::Message;
use tokio_util::codec::Decoder;

const LIMIT: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    let _ = Message::from_bytes(data, None, LIMIT);
    let _ = Message::from_bytes(data, Some(b"fuzz"), LIMIT);

    let mut codec = PacketCodec::new(Some(b"fuzz"), LIMIT);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
