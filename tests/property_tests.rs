//! Property-based tests using proptest
//!
//! These tests check the codec laws over randomly generated input: NDR
//! values survive a round trip in every transfer syntax and byte order,
//! arbitrary bytes never panic a decoder, and fragmentation preserves the
//! stub exactly.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use bytes::Bytes;
use dcerpc_engine::core::fragment::{fragment_flags, split_body, stub_capacity, Reassembler};
use dcerpc_engine::core::ndr::{
    self, from_ndr, to_ndr, Arm, ContextHandle, PointerKind, TypeDesc, UnionDesc, Value,
};
use dcerpc_engine::core::pdu::{Pdu, PduBody, RequestPdu, MUST_RECV_FRAG_SIZE, REQUEST_PREFIX_SIZE};
use dcerpc_engine::core::syntax::{
    DataRepresentation, IntegerOrder, NdrFormat, TransferSyntax, Uuid,
};
use proptest::prelude::*;

fn formats() -> impl Strategy<Value = NdrFormat> {
    (
        prop_oneof![Just(TransferSyntax::Ndr20), Just(TransferSyntax::Ndr64)],
        prop_oneof![Just(IntegerOrder::Little), Just(IntegerOrder::Big)],
    )
        .prop_map(|(syntax, order)| NdrFormat::new(syntax, DataRepresentation::new(order)))
}

/// A record shaped like a typical out-parameter block: scalars, a string,
/// an optional referent and a trailing conformant array.
fn record_desc() -> TypeDesc {
    TypeDesc::Struct(vec![
        TypeDesc::U8,
        TypeDesc::U16,
        TypeDesc::U32,
        TypeDesc::U64,
        TypeDesc::unique(TypeDesc::wide_string()),
        TypeDesc::unique(TypeDesc::I32),
        TypeDesc::conformant(TypeDesc::U16),
    ])
}

fn record_value() -> impl Strategy<Value = Value> {
    (
        any::<u8>(),
        any::<u16>(),
        any::<u32>(),
        any::<u64>(),
        prop::option::of("[a-zA-Z0-9 ]{0,40}"),
        prop::option::of(any::<i32>()),
        prop::collection::vec(any::<u16>(), 0..64),
    )
        .prop_map(|(a, b, c, d, name, opt, tail)| {
            Value::Struct(vec![
                Value::U8(a),
                Value::U16(b),
                Value::U32(c),
                Value::U64(d),
                name.map_or_else(Value::null, |s| Value::pointer(Value::String(s))),
                opt.map_or_else(Value::null, |v| Value::pointer(Value::I32(v))),
                Value::Array(tail.into_iter().map(Value::U16).collect()),
            ])
        })
}

// Property: every well-typed value decodes back to itself
proptest! {
    #[test]
    fn prop_ndr_record_roundtrip(value in record_value(), fmt in formats()) {
        let desc = record_desc();
        let bytes = ndr::encode(&value, &desc, &fmt).expect("Encoding should not fail");
        let decoded = ndr::decode(&bytes, &desc, &fmt).expect("Decoding should not fail");
        prop_assert_eq!(decoded, value);
    }
}

/// Random type descriptors, nested up to three levels.
fn type_desc() -> impl Strategy<Value = TypeDesc> {
    let leaf = prop_oneof![
        Just(TypeDesc::U8),
        Just(TypeDesc::I8),
        Just(TypeDesc::U16),
        Just(TypeDesc::I16),
        Just(TypeDesc::U32),
        Just(TypeDesc::I32),
        Just(TypeDesc::U64),
        Just(TypeDesc::I64),
        Just(TypeDesc::F32),
        Just(TypeDesc::F64),
        Just(TypeDesc::Char),
        Just(TypeDesc::WChar),
        Just(TypeDesc::Uuid),
        Just(TypeDesc::ContextHandle),
        Just(TypeDesc::String { wide: false }),
        Just(TypeDesc::String { wide: true }),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(TypeDesc::Struct),
            prop::collection::vec(inner.clone(), 1..4).prop_map(TypeDesc::Params),
            (inner.clone(), 1..4usize).prop_map(|(e, n)| TypeDesc::FixedArray(Box::new(e), n)),
            inner.clone().prop_map(TypeDesc::conformant),
            (inner.clone(), 1..4usize).prop_map(|(e, n)| TypeDesc::VaryingArray(Box::new(e), n)),
            inner.clone().prop_map(|e| TypeDesc::ConformantVaryingArray(Box::new(e))),
            inner.clone().prop_map(TypeDesc::unique),
            inner.clone().prop_map(TypeDesc::full),
            inner.clone().prop_map(TypeDesc::reference),
            (
                prop_oneof![
                    Just(TypeDesc::U8),
                    Just(TypeDesc::U16),
                    Just(TypeDesc::U32),
                    Just(TypeDesc::I64)
                ],
                prop::collection::vec(inner, 1..3),
            )
                .prop_map(|(discriminant, arms)| {
                    let mut cases: Vec<(i64, Arm)> = arms
                        .into_iter()
                        .enumerate()
                        .map(|(i, arm)| (i as i64 + 1, Arm::Body(arm)))
                        .collect();
                    cases.push((99, Arm::Empty));
                    TypeDesc::Union(UnionDesc {
                        discriminant: Box::new(discriminant),
                        cases,
                        default: None,
                    })
                }),
        ]
    })
}

/// Values that fit `desc`.
fn value_of(desc: &TypeDesc) -> BoxedStrategy<Value> {
    let finite32 = prop::num::f32::NORMAL | prop::num::f32::ZERO | prop::num::f32::SUBNORMAL;
    let finite64 = prop::num::f64::NORMAL | prop::num::f64::ZERO | prop::num::f64::SUBNORMAL;
    match desc {
        TypeDesc::U8 => any::<u8>().prop_map(Value::U8).boxed(),
        TypeDesc::I8 => any::<i8>().prop_map(Value::I8).boxed(),
        TypeDesc::U16 => any::<u16>().prop_map(Value::U16).boxed(),
        TypeDesc::I16 => any::<i16>().prop_map(Value::I16).boxed(),
        TypeDesc::U32 => any::<u32>().prop_map(Value::U32).boxed(),
        TypeDesc::I32 => any::<i32>().prop_map(Value::I32).boxed(),
        TypeDesc::U64 => any::<u64>().prop_map(Value::U64).boxed(),
        TypeDesc::I64 => any::<i64>().prop_map(Value::I64).boxed(),
        TypeDesc::F32 => finite32.prop_map(Value::F32).boxed(),
        TypeDesc::F64 => finite64.prop_map(Value::F64).boxed(),
        TypeDesc::Char => any::<u8>().prop_map(Value::Char).boxed(),
        TypeDesc::WChar => any::<u16>().prop_map(Value::WChar).boxed(),
        TypeDesc::Uuid => (any::<u32>(), any::<u16>(), any::<u16>(), any::<[u8; 8]>())
            .prop_map(|(a, b, c, d)| Value::Uuid(Uuid::from_fields(a, b, c, d)))
            .boxed(),
        TypeDesc::ContextHandle => any::<[u8; 20]>()
            .prop_map(|raw| Value::ContextHandle(ContextHandle(raw)))
            .boxed(),
        TypeDesc::String { wide: false } => "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String).boxed(),
        TypeDesc::String { wide: true } => "\\PC{0,8}".prop_map(Value::String).boxed(),
        TypeDesc::Struct(members) | TypeDesc::Params(members) => members
            .iter()
            .map(value_of)
            .collect::<Vec<_>>()
            .prop_map(Value::Struct)
            .boxed(),
        TypeDesc::FixedArray(elem, n) => prop::collection::vec(value_of(elem), *n)
            .prop_map(Value::Array)
            .boxed(),
        TypeDesc::ConformantArray(elem) | TypeDesc::ConformantVaryingArray(elem) => {
            prop::collection::vec(value_of(elem), 0..4)
                .prop_map(Value::Array)
                .boxed()
        }
        TypeDesc::VaryingArray(elem, max) => prop::collection::vec(value_of(elem), 0..=*max)
            .prop_map(Value::Array)
            .boxed(),
        TypeDesc::Pointer(PointerKind::Ref, inner) => value_of(inner).prop_map(Value::pointer).boxed(),
        TypeDesc::Pointer(_, inner) => prop::option::of(value_of(inner))
            .prop_map(|target| target.map_or_else(Value::null, Value::pointer))
            .boxed(),
        TypeDesc::Union(u) => {
            let cases = u.cases.clone();
            (0..cases.len())
                .prop_flat_map(move |i| {
                    let (discriminant, arm) = cases[i].clone();
                    match arm {
                        Arm::Empty => Just(Value::Union {
                            discriminant,
                            arm: None,
                        })
                        .boxed(),
                        Arm::Body(arm) => value_of(&arm)
                            .prop_map(move |v| Value::Union {
                                discriminant,
                                arm: Some(Box::new(v)),
                            })
                            .boxed(),
                    }
                })
                .boxed()
        }
    }
}

fn described_value() -> impl Strategy<Value = (TypeDesc, Value)> {
    type_desc().prop_flat_map(|desc| {
        let values = value_of(&desc);
        (Just(desc), values)
    })
}

// Property: any descriptor and a value of its shape survive a round trip
proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_ndr_described_roundtrip((desc, value) in described_value(), fmt in formats()) {
        let bytes = ndr::encode(&value, &desc, &fmt).expect("Encoding should not fail");
        let decoded = ndr::decode(&bytes, &desc, &fmt).expect("Decoding should not fail");
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn prop_ndr_decode_any_descriptor_never_panics(
        desc in type_desc(),
        bytes in prop::collection::vec(any::<u8>(), 0..256),
        fmt in formats(),
    ) {
        let _ = ndr::decode(&bytes, &desc, &fmt);
    }
}

// Property: full pointers to one value share a referent after decoding
proptest! {
    #[test]
    fn prop_full_pointer_aliasing_preserved(
        (desc, target) in described_value(),
        aliased in any::<bool>(),
        fmt in formats(),
    ) {
        let desc = TypeDesc::Struct(vec![TypeDesc::full(desc.clone()), TypeDesc::full(desc)]);
        let first = Arc::new(target);
        let second = if aliased { Arc::clone(&first) } else { Arc::new((*first).clone()) };
        let value = Value::Struct(vec![Value::Pointer(Some(first)), Value::Pointer(Some(second))]);

        let bytes = ndr::encode(&value, &desc, &fmt).unwrap();
        let decoded = ndr::decode(&bytes, &desc, &fmt).unwrap();
        prop_assert_eq!(&decoded, &value);
        match decoded {
            Value::Struct(fields) => match (&fields[0], &fields[1]) {
                (Value::Pointer(Some(a)), Value::Pointer(Some(b))) => {
                    prop_assert_eq!(Arc::ptr_eq(a, b), aliased);
                }
                other => prop_assert!(false, "unexpected fields {:?}", other),
            },
            other => prop_assert!(false, "unexpected value {:?}", other),
        }
    }
}

// Property: the typed facade agrees with itself for tuples and vectors
proptest! {
    #[test]
    fn prop_typed_roundtrip(
        id in any::<u32>(),
        name in "[a-z]{0,24}",
        data in prop::collection::vec(any::<u8>(), 0..512),
        fmt in formats(),
    ) {
        let request = (id, name.clone(), data.clone());
        let bytes = to_ndr(&request, &fmt).unwrap();
        let back: (u32, String, Vec<u8>) = from_ndr(&bytes, &fmt).unwrap();
        prop_assert_eq!(back, (id, name, data));
    }
}

// Property: arbitrary input never panics the NDR decoder
proptest! {
    #[test]
    fn prop_ndr_decode_never_panics(
        bytes in prop::collection::vec(any::<u8>(), 0..256),
        fmt in formats(),
    ) {
        let _ = ndr::decode(&bytes, &record_desc(), &fmt);
        let _ = ndr::decode(&bytes, &TypeDesc::full(TypeDesc::full(TypeDesc::U32)), &fmt);
    }
}

// Property: arbitrary input never panics the PDU parser
proptest! {
    #[test]
    fn prop_pdu_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Pdu::decode(&bytes);
    }
}

// Property: splitting then reassembling restores the stub, and no fragment
// exceeds the negotiated size
proptest! {
    #[test]
    fn prop_fragmentation_preserves_stub(
        stub in prop::collection::vec(any::<u8>(), 0..20_000),
        max_frag in MUST_RECV_FRAG_SIZE..6000u16,
    ) {
        let stub = Bytes::from(stub);
        let chunks = split_body(&stub, stub_capacity(max_frag, REQUEST_PREFIX_SIZE, None));
        let total = chunks.len();
        let mut reassembler = Reassembler::new(usize::MAX);
        let mut remaining = stub.len();
        let mut whole = None;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let alloc_hint = remaining as u32;
            remaining -= chunk.len();
            let pdu = Pdu::new(
                9,
                DataRepresentation::LITTLE_ENDIAN,
                PduBody::Request(RequestPdu { alloc_hint, context_id: 0, opnum: 1, object: None, stub: chunk }),
            )
            .with_flags(fragment_flags(index, total));

            let frag = pdu.encode().unwrap();
            prop_assert!(frag.len() <= max_frag as usize);
            let parsed = Pdu::decode(&frag).unwrap();
            if let Some(done) = reassembler.push(parsed).unwrap() {
                prop_assert_eq!(index + 1, total);
                whole = Some(done);
            }
        }

        match whole.map(|p| p.body) {
            Some(PduBody::Request(req)) => prop_assert_eq!(req.stub, stub),
            other => prop_assert!(false, "no reassembled request: {:?}", other),
        }
    }
}
