//! Strongly typed facade over the dynamic codec.
//!
//! Interface definitions implement [`NdrType`] for their request and response
//! types; the dispatch table and the client call path use it to move between
//! Rust values and stub bytes.

use super::types::{ContextHandle, TypeDesc, Value};
use crate::core::syntax::{NdrFormat, Uuid};
use crate::error::{DecodeError, EncodeError};
use std::sync::Arc;

/// A Rust type with a fixed NDR layout.
pub trait NdrType: Sized {
    fn type_desc() -> TypeDesc;
    fn to_value(&self) -> Value;
    fn from_value(value: Value) -> Result<Self, DecodeError>;
}

/// Encode a typed value as one top-level stub.
pub fn to_ndr<T: NdrType>(value: &T, fmt: &NdrFormat) -> Result<Vec<u8>, EncodeError> {
    super::encode(&value.to_value(), &T::type_desc(), fmt)
}

/// Decode a typed value from a complete stub.
pub fn from_ndr<T: NdrType>(bytes: &[u8], fmt: &NdrFormat) -> Result<T, DecodeError> {
    T::from_value(super::decode(bytes, &T::type_desc(), fmt)?)
}

macro_rules! scalar_ndr_type {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl NdrType for $ty {
                fn type_desc() -> TypeDesc {
                    TypeDesc::$variant
                }

                fn to_value(&self) -> Value {
                    Value::$variant(*self)
                }

                fn from_value(value: Value) -> Result<Self, DecodeError> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        _ => Err(DecodeError::UnexpectedValue(stringify!($ty))),
                    }
                }
            }
        )*
    };
}

scalar_ndr_type! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    Uuid => Uuid,
    ContextHandle => ContextHandle,
}

impl NdrType for bool {
    fn type_desc() -> TypeDesc {
        TypeDesc::U8
    }

    fn to_value(&self) -> Value {
        Value::U8(u8::from(*self))
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::U8(v) => Ok(v != 0),
            _ => Err(DecodeError::UnexpectedValue("bool")),
        }
    }
}

/// Strings travel as wide terminated strings.
impl NdrType for String {
    fn type_desc() -> TypeDesc {
        TypeDesc::wide_string()
    }

    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::String(s) => Ok(s),
            _ => Err(DecodeError::UnexpectedValue("String")),
        }
    }
}

impl<T: NdrType> NdrType for Vec<T> {
    fn type_desc() -> TypeDesc {
        TypeDesc::conformant(T::type_desc())
    }

    fn to_value(&self) -> Value {
        Value::Array(self.iter().map(NdrType::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            _ => Err(DecodeError::UnexpectedValue("Vec")),
        }
    }
}

/// `Option<T>` is a unique pointer to `T`.
impl<T: NdrType> NdrType for Option<T> {
    fn type_desc() -> TypeDesc {
        TypeDesc::unique(T::type_desc())
    }

    fn to_value(&self) -> Value {
        match self {
            Some(v) => Value::pointer(v.to_value()),
            None => Value::null(),
        }
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Pointer(None) => Ok(None),
            Value::Pointer(Some(shared)) => {
                let inner = Arc::try_unwrap(shared).unwrap_or_else(|s| (*s).clone());
                T::from_value(inner).map(Some)
            }
            _ => Err(DecodeError::UnexpectedValue("Option")),
        }
    }
}

impl NdrType for () {
    fn type_desc() -> TypeDesc {
        TypeDesc::Params(Vec::new())
    }

    fn to_value(&self) -> Value {
        Value::Struct(Vec::new())
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Struct(fields) if fields.is_empty() => Ok(()),
            _ => Err(DecodeError::UnexpectedValue("()")),
        }
    }
}

/// Tuples are operation parameter lists: each element is marshaled in turn,
/// with its referents right behind it. IDL structures need an explicit
/// [`TypeDesc::Struct`] descriptor.
macro_rules! tuple_ndr_type {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: NdrType),+> NdrType for ($($name,)+) {
            fn type_desc() -> TypeDesc {
                TypeDesc::Params(vec![$($name::type_desc()),+])
            }

            fn to_value(&self) -> Value {
                Value::Struct(vec![$(self.$idx.to_value()),+])
            }

            fn from_value(value: Value) -> Result<Self, DecodeError> {
                let fields = match value {
                    Value::Struct(fields) => fields,
                    _ => return Err(DecodeError::UnexpectedValue("tuple")),
                };
                let mut fields = fields.into_iter();
                Ok(($(
                    $name::from_value(
                        fields.next().ok_or(DecodeError::UnexpectedValue("tuple"))?,
                    )?,
                )+))
            }
        }
    };
}

tuple_ndr_type!(A: 0);
tuple_ndr_type!(A: 0, B: 1);
tuple_ndr_type!(A: 0, B: 1, C: 2);
tuple_ndr_type!(A: 0, B: 1, C: 2, D: 3);
tuple_ndr_type!(A: 0, B: 1, C: 2, D: 3, E: 4);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_roundtrip() {
        let fmt = NdrFormat::ndr20();
        let value = (7u16, String::from("share"), Some(42u32), vec![1u8, 2, 3]);
        let bytes = to_ndr(&value, &fmt).unwrap();
        let back: (u16, String, Option<u32>, Vec<u8>) = from_ndr(&bytes, &fmt).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_tuple_marshals_parameters_in_order() {
        let fmt = NdrFormat::ndr20();
        let value = (ContextHandle([0x11; 20]), String::from("ab"));
        let bytes = to_ndr(&value, &fmt).unwrap();

        let mut expected = vec![0x11; 20];
        expected.extend_from_slice(&[3, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0]);
        expected.extend_from_slice(&[b'a', 0, b'b', 0, 0, 0]);
        assert_eq!(bytes, expected);

        let back: (ContextHandle, String) = from_ndr(&bytes, &fmt).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_tuple_referents_follow_their_parameter() {
        let fmt = NdrFormat::ndr20();
        let value = (Some(7u32), 9u16);
        let bytes = to_ndr(&value, &fmt).unwrap();
        // referent id, its pointee, then the next parameter
        assert_eq!(bytes, vec![0, 0, 2, 0, 7, 0, 0, 0, 9, 0]);

        let back: (Option<u32>, u16) = from_ndr(&bytes, &fmt).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_option_none_is_null_referent() {
        let fmt = NdrFormat::ndr20();
        let bytes = to_ndr(&Option::<u32>::None, &fmt).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let err = u32::from_value(Value::U16(1)).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedValue("u32"));
    }
}
