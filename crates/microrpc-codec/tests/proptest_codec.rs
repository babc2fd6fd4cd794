//! Property-based tests for the built-in codecs.

use microrpc_codec::registry::BUILTIN_CONTENT_TYPES;
use microrpc_codec::{CodecExt, CodecRegistry, Message, MessageType};
use proptest::prelude::*;

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Request),
        Just(MessageType::Response),
        Just(MessageType::Error),
        Just(MessageType::Event),
    ]
}

fn content_type() -> impl Strategy<Value = &'static str> {
    proptest::sample::select(BUILTIN_CONTENT_TYPES.to_vec())
}

proptest! {
    #[test]
    fn prop_nil_body_write_always_succeeds(
        ct in content_type(),
        mt in message_type(),
        id in "[0-9a-z]{0,12}",
        endpoint in "[A-Z][a-z]{0,8}\\.[A-Z][a-z]{0,8}",
        error in "[ -~]{0,32}",
    ) {
        let mut codec = CodecRegistry::new().new_codec(ct).unwrap();
        let mut msg = Message { id, endpoint, error, ..Message::new(mt) };
        prop_assert!(codec.write(&mut msg, None).is_ok());
    }

    #[test]
    fn prop_request_payload_survives(
        ct in proptest::sample::select(vec![
            "application/bincode",
            "application/json",
            "application/bincode-rpc",
            "application/json-rpc",
            "application/grpc",
            "application/grpc+json",
        ]),
        name in "[ -~]{0,64}",
        seq in 1u64..1_000_000,
    ) {
        let registry = CodecRegistry::new();
        let mut writer = registry.new_codec(ct).unwrap();
        let mut msg = Message {
            id: seq.to_string(),
            endpoint: "Greeter.Hello".into(),
            ..Message::new(MessageType::Request)
        };
        writer.write_value(&mut msg, Some(&name)).unwrap();
        let wire = writer.buffer().take_written();

        let mut reader = registry.new_codec(ct).unwrap();
        reader.buffer().reset_read(&wire);
        let mut out = Message { header: msg.header.clone(), ..Message::default() };
        reader.read_header(&mut out, MessageType::Request).unwrap();
        let decoded: String = reader.read_body_into().unwrap();
        prop_assert_eq!(decoded, name);
    }

    #[test]
    fn prop_error_field_survives_self_describing_codecs(
        ct in proptest::sample::select(vec!["application/bincode-rpc", "application/json-rpc"]),
        error in "[a-zA-Z0-9 {}:,\"]{1,48}",
    ) {
        let registry = CodecRegistry::new();
        let mut codec = registry.new_codec(ct).unwrap();
        let mut msg = Message { id: "9".into(), error: error.clone(), ..Message::new(MessageType::Error) };
        codec.write(&mut msg, None).unwrap();
        let wire = codec.buffer().take_written();
        codec.buffer().reset_read(&wire);
        let mut out = Message::default();
        codec.read_header(&mut out, MessageType::Response).unwrap();
        prop_assert_eq!(out.error, error);
        prop_assert_eq!(out.id, "9");
    }
}
