//! Property tests for signature and value round-trips.

use dbusprims_wire::{
    decode_value, encode_value, marshal, parse_single_type, signature_string, unmarshal,
    Endianness, Message, ObjectPath, ReadCursor, Signature, TypeNode, Value, WriteCursor,
};
use dbusprims_wire::signature::MAX_SIGNATURE_LEN;
use proptest::prelude::*;

fn basic_type() -> impl Strategy<Value = TypeNode> {
    prop_oneof![
        Just(TypeNode::Byte),
        Just(TypeNode::Boolean),
        Just(TypeNode::Int16),
        Just(TypeNode::UInt16),
        Just(TypeNode::Int32),
        Just(TypeNode::UInt32),
        Just(TypeNode::Int64),
        Just(TypeNode::UInt64),
        Just(TypeNode::Double),
        Just(TypeNode::String),
        Just(TypeNode::ObjectPath),
        Just(TypeNode::Signature),
        Just(TypeNode::UnixFd),
    ]
}

fn any_type() -> impl Strategy<Value = TypeNode> {
    prop_oneof![basic_type(), Just(TypeNode::Variant)].prop_recursive(4, 24, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(|elem| TypeNode::Array(Box::new(elem))),
            prop::collection::vec(inner.clone(), 1..4).prop_map(TypeNode::Struct),
            (basic_type(), inner).prop_map(|(key, value)| {
                TypeNode::Array(Box::new(TypeNode::DictEntry(Box::new(key), Box::new(value))))
            }),
        ]
    })
}

fn object_path() -> impl Strategy<Value = ObjectPath> {
    prop::collection::vec("[A-Za-z0-9_]{1,6}", 0..4).prop_map(|segments| {
        let path = if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", segments.join("/"))
        };
        ObjectPath::new(path).unwrap()
    })
}

fn value_for(ty: &TypeNode) -> BoxedStrategy<Value> {
    match ty {
        TypeNode::Byte => any::<u8>().prop_map(Value::Byte).boxed(),
        TypeNode::Boolean => any::<bool>().prop_map(Value::Boolean).boxed(),
        TypeNode::Int16 => any::<i16>().prop_map(Value::Int16).boxed(),
        TypeNode::UInt16 => any::<u16>().prop_map(Value::UInt16).boxed(),
        TypeNode::Int32 => any::<i32>().prop_map(Value::Int32).boxed(),
        TypeNode::UInt32 => any::<u32>().prop_map(Value::UInt32).boxed(),
        TypeNode::Int64 => any::<i64>().prop_map(Value::Int64).boxed(),
        TypeNode::UInt64 => any::<u64>().prop_map(Value::UInt64).boxed(),
        TypeNode::Double => (-1.0e12f64..1.0e12).prop_map(Value::Double).boxed(),
        TypeNode::String => "[ -~]{0,12}".prop_map(Value::String).boxed(),
        TypeNode::ObjectPath => object_path().prop_map(Value::ObjectPath).boxed(),
        TypeNode::Signature => prop_oneof![Just(""), Just("s"), Just("a{sv}"), Just("(iai)")]
            .prop_map(|s| Value::Signature(Signature::new(s).unwrap()))
            .boxed(),
        TypeNode::UnixFd => any::<u32>().prop_map(Value::UnixFd).boxed(),
        TypeNode::Variant => prop_oneof![
            any::<u32>().prop_map(Value::UInt32),
            "[a-z]{0,8}".prop_map(Value::String),
            any::<i64>().prop_map(|n| Value::array([n])),
        ]
        .prop_map(|inner| Value::variant(inner).unwrap())
        .boxed(),
        TypeNode::Array(elem) => match elem.as_ref() {
            TypeNode::DictEntry(key, value) => {
                prop::collection::vec((value_for(key), value_for(value)), 0..4)
                    .prop_map(|pairs| Value::Dict(pairs.into_iter().collect()))
                    .boxed()
            }
            _ => prop::collection::vec(value_for(elem), 0..4)
                .prop_map(Value::Array)
                .boxed(),
        },
        TypeNode::Struct(fields) => fields
            .iter()
            .map(value_for)
            .collect::<Vec<_>>()
            .prop_map(Value::Struct)
            .boxed(),
        TypeNode::DictEntry(_, _) => unreachable!("dict entries only occur inside arrays"),
    }
}

fn typed_value() -> impl Strategy<Value = (TypeNode, Value)> {
    any_type().prop_flat_map(|ty| {
        let values = value_for(&ty);
        (Just(ty), values)
    })
}

fn endianness() -> impl Strategy<Value = Endianness> {
    prop_oneof![Just(Endianness::Little), Just(Endianness::Big)]
}

proptest! {
    #[test]
    fn signature_text_is_idempotent(ty in any_type()) {
        let text = ty.to_string();
        prop_assume!(text.len() <= MAX_SIGNATURE_LEN);
        let parsed = parse_single_type(&text).unwrap();
        prop_assert_eq!(parsed.to_string(), text);
        prop_assert_eq!(parsed, ty);
    }

    #[test]
    fn value_roundtrips((ty, value) in typed_value(), endian in endianness(), lead in 0usize..8) {
        let mut w = WriteCursor::new(endian);
        // Start at an arbitrary offset so padding is exercised.
        for _ in 0..lead {
            w.write_u8(0xEE);
        }
        encode_value(&mut w, &ty, &value).unwrap();
        let bytes = w.into_inner();

        let mut r = ReadCursor::at(&bytes, lead, endian);
        let decoded = decode_value(&mut r, &ty).unwrap();
        prop_assert_eq!(r.remaining(), 0);
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn message_body_roundtrips(
        body in prop::collection::vec(typed_value(), 0..4),
        endian in endianness(),
        serial in 1u32..=u32::MAX,
    ) {
        let (types, values): (Vec<TypeNode>, Vec<Value>) = body.into_iter().unzip();
        prop_assume!(signature_string(&types).len() <= MAX_SIGNATURE_LEN);
        let signature = Signature::from_types(types).unwrap();
        let mut message = Message::method_call("/prop/test", "Check")
            .unwrap()
            .with_serial(serial);
        message.set_body(signature, values).unwrap();

        let decoded = unmarshal(&marshal(&message, endian).unwrap()).unwrap();
        prop_assert_eq!(decoded, message);
    }
}
