use bytes::BytesMut;
use pyro_wire::config::MAX_MESSAGE_SIZE;
use pyro_wire::core::codec::PacketCodec;
use pyro_wire::core::serialization::PickleSerializer;
use pyro_wire::core::unpickler::default_registry;
use pyro_wire::{Message, MessageFlags, MessageType, PayloadSerializer, Value};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_pickle_and_envelope_heavy() {
    use tokio::task::JoinSet;

    let iterations = 2_000usize;
    let payload_sizes = [0usize, 16, 256, 4096];
    let serializer = Arc::new(PickleSerializer::new(default_registry(), 2).unwrap());

    let mut tasks = JoinSet::new();
    for &size in &payload_sizes {
        let serializer = Arc::clone(&serializer);
        tasks.spawn(async move {
            let mut codec = PacketCodec::new(Some(b"shared"), MAX_MESSAGE_SIZE);
            let mut buf = BytesMut::new();
            for i in 0..iterations {
                let value = Value::list(vec![
                    Value::Int(i as i64),
                    Value::Bytes(vec![(i & 0xFF) as u8; size]),
                ]);
                let data = serializer.serialize_data(&value).unwrap();
                let msg = Message::new(MessageType::Result, data, 4, MessageFlags::empty(), i as u32);
                codec.encode(msg, &mut buf).unwrap();

                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                assert_eq!(decoded.seq, i as u32);
                assert_eq!(serializer.deserialize_data(&decoded.data).unwrap(), value);
                assert!(buf.is_empty());
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}
