//! Type descriptors and dynamically typed values for the NDR codec.

use crate::core::syntax::{TransferSyntax, Uuid};
use std::sync::Arc;

/// Opaque 20-byte context handle. The codec copies its bytes verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextHandle(pub [u8; 20]);

impl ContextHandle {
    pub const SIZE: usize = 20;

    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// How a pointer is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    /// Never null, carries no referent id; the referent is written in place.
    Ref,
    /// May be null; every non-null occurrence gets a fresh referent id.
    Unique,
    /// May be null; occurrences of the same value share one referent id.
    Full,
}

/// Union arm payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Arm {
    Empty,
    Body(TypeDesc),
}

/// Non-encapsulated union: the discriminant is written before the selected arm.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionDesc {
    /// Integer scalar descriptor for the discriminant.
    pub discriminant: Box<TypeDesc>,
    pub cases: Vec<(i64, Arm)>,
    pub default: Option<Box<Arm>>,
}

impl UnionDesc {
    pub fn arm(&self, discriminant: i64) -> Option<&Arm> {
        self.cases
            .iter()
            .find(|(case, _)| *case == discriminant)
            .map(|(_, arm)| arm)
            .or(self.default.as_deref())
    }
}

/// Describes the wire layout of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDesc {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    /// 8-bit character.
    Char,
    /// 16-bit character.
    WChar,
    Uuid,
    ContextHandle,
    Struct(Vec<TypeDesc>),
    /// Operation parameters, marshaled one after another. Unlike a structure
    /// nothing is hoisted, and at the top of a stub each parameter's referents
    /// follow that parameter.
    Params(Vec<TypeDesc>),
    FixedArray(Box<TypeDesc>, usize),
    ConformantArray(Box<TypeDesc>),
    /// Varying array with a declared maximum element count.
    VaryingArray(Box<TypeDesc>, usize),
    ConformantVaryingArray(Box<TypeDesc>),
    /// Terminated string; `wide` selects 16-bit characters.
    String { wide: bool },
    Pointer(PointerKind, Box<TypeDesc>),
    Union(UnionDesc),
}

impl TypeDesc {
    pub fn unique(inner: TypeDesc) -> Self {
        TypeDesc::Pointer(PointerKind::Unique, Box::new(inner))
    }

    pub fn full(inner: TypeDesc) -> Self {
        TypeDesc::Pointer(PointerKind::Full, Box::new(inner))
    }

    pub fn reference(inner: TypeDesc) -> Self {
        TypeDesc::Pointer(PointerKind::Ref, Box::new(inner))
    }

    pub fn conformant(elem: TypeDesc) -> Self {
        TypeDesc::ConformantArray(Box::new(elem))
    }

    pub fn wide_string() -> Self {
        TypeDesc::String { wide: true }
    }

    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            TypeDesc::U8 => "u8",
            TypeDesc::I8 => "i8",
            TypeDesc::U16 => "u16",
            TypeDesc::I16 => "i16",
            TypeDesc::U32 => "u32",
            TypeDesc::I32 => "i32",
            TypeDesc::U64 => "u64",
            TypeDesc::I64 => "i64",
            TypeDesc::F32 => "f32",
            TypeDesc::F64 => "f64",
            TypeDesc::Char => "char",
            TypeDesc::WChar => "wchar",
            TypeDesc::Uuid => "uuid",
            TypeDesc::ContextHandle => "context handle",
            TypeDesc::Struct(_) => "struct",
            TypeDesc::Params(_) => "parameter list",
            TypeDesc::FixedArray(..) => "fixed array",
            TypeDesc::ConformantArray(_) => "conformant array",
            TypeDesc::VaryingArray(..) => "varying array",
            TypeDesc::ConformantVaryingArray(_) => "conformant varying array",
            TypeDesc::String { .. } => "string",
            TypeDesc::Pointer(..) => "pointer",
            TypeDesc::Union(_) => "union",
        }
    }

    /// Alignment of the first byte of this type.
    pub fn alignment(&self, syntax: TransferSyntax) -> usize {
        let word = syntax.word_size();
        match self {
            TypeDesc::U8 | TypeDesc::I8 | TypeDesc::Char => 1,
            TypeDesc::U16 | TypeDesc::I16 | TypeDesc::WChar => 2,
            TypeDesc::U32 | TypeDesc::I32 | TypeDesc::F32 => 4,
            TypeDesc::U64 | TypeDesc::I64 | TypeDesc::F64 => 8,
            TypeDesc::Uuid | TypeDesc::ContextHandle => 4,
            TypeDesc::Struct(members) => {
                let inner = members
                    .iter()
                    .map(|m| m.alignment(syntax))
                    .max()
                    .unwrap_or(1);
                if self.conformant_tail().is_some() {
                    inner.max(word)
                } else {
                    inner
                }
            }
            TypeDesc::Params(members) => members
                .iter()
                .map(|m| m.alignment(syntax))
                .max()
                .unwrap_or(1),
            TypeDesc::FixedArray(elem, _) => elem.alignment(syntax),
            TypeDesc::ConformantArray(elem)
            | TypeDesc::VaryingArray(elem, _)
            | TypeDesc::ConformantVaryingArray(elem) => elem.alignment(syntax).max(word),
            TypeDesc::String { .. } => word,
            TypeDesc::Pointer(PointerKind::Ref, inner) => inner.alignment(syntax),
            TypeDesc::Pointer(..) => word,
            TypeDesc::Union(u) => u
                .cases
                .iter()
                .map(|(_, arm)| arm)
                .chain(u.default.as_deref().into_iter())
                .map(|arm| match arm {
                    Arm::Empty => 1,
                    Arm::Body(desc) => desc.alignment(syntax),
                })
                .fold(u.discriminant.alignment(syntax), usize::max),
        }
    }

    /// Smallest number of bytes any encoding of this type occupies, ignoring padding.
    ///
    /// Used to reject declared counts the remaining buffer cannot possibly hold.
    pub fn min_wire_size(&self, syntax: TransferSyntax) -> usize {
        let word = syntax.word_size();
        match self {
            TypeDesc::U8 | TypeDesc::I8 | TypeDesc::Char => 1,
            TypeDesc::U16 | TypeDesc::I16 | TypeDesc::WChar => 2,
            TypeDesc::U32 | TypeDesc::I32 | TypeDesc::F32 => 4,
            TypeDesc::U64 | TypeDesc::I64 | TypeDesc::F64 => 8,
            TypeDesc::Uuid => 16,
            TypeDesc::ContextHandle => ContextHandle::SIZE,
            TypeDesc::Struct(members) | TypeDesc::Params(members) => members
                .iter()
                .fold(0usize, |acc, m| acc.saturating_add(m.min_wire_size(syntax))),
            TypeDesc::FixedArray(elem, n) => elem.min_wire_size(syntax).saturating_mul(*n),
            TypeDesc::ConformantArray(_) => word,
            TypeDesc::VaryingArray(..) => 2 * word,
            TypeDesc::ConformantVaryingArray(_) => 3 * word,
            TypeDesc::String { wide } => 3 * word + if *wide { 2 } else { 1 },
            TypeDesc::Pointer(PointerKind::Ref, inner) => inner.min_wire_size(syntax),
            TypeDesc::Pointer(..) => word,
            TypeDesc::Union(u) => u.discriminant.min_wire_size(syntax),
        }
    }

    /// For a structure ending in a conformant array (directly or through a
    /// nested trailing structure), the array whose conformance is hoisted.
    pub fn conformant_tail(&self) -> Option<&TypeDesc> {
        match self {
            TypeDesc::Struct(members) => match members.last()? {
                tail @ (TypeDesc::ConformantArray(_)
                | TypeDesc::ConformantVaryingArray(_)
                | TypeDesc::String { .. }) => Some(tail),
                nested @ TypeDesc::Struct(_) => nested.conformant_tail(),
                _ => None,
            },
            _ => None,
        }
    }
}

/// A dynamically typed NDR value, interpreted through a [`TypeDesc`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Char(u8),
    WChar(u16),
    Uuid(Uuid),
    ContextHandle(ContextHandle),
    Struct(Vec<Value>),
    Array(Vec<Value>),
    String(String),
    /// `None` is a null pointer. Full pointers alias when they share an `Arc`.
    Pointer(Option<Arc<Value>>),
    Union {
        discriminant: i64,
        arm: Option<Box<Value>>,
    },
}

impl Value {
    pub fn pointer(inner: Value) -> Self {
        Value::Pointer(Some(Arc::new(inner)))
    }

    pub fn null() -> Self {
        Value::Pointer(None)
    }
}

/// Upper bounds the decoder enforces regardless of what the input claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Largest element count accepted for any single array or string.
    pub max_elements: usize,
    /// Deepest chain of pointer indirections resolved.
    pub max_depth: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_elements: 16 * 1024 * 1024,
            max_depth: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_rules() {
        let s = TypeDesc::Struct(vec![TypeDesc::U8, TypeDesc::U16]);
        assert_eq!(s.alignment(TransferSyntax::Ndr20), 2);
        let conf = TypeDesc::Struct(vec![TypeDesc::U8, TypeDesc::conformant(TypeDesc::U8)]);
        assert_eq!(conf.alignment(TransferSyntax::Ndr20), 4);
        assert_eq!(conf.alignment(TransferSyntax::Ndr64), 8);
        assert_eq!(TypeDesc::unique(TypeDesc::U8).alignment(TransferSyntax::Ndr64), 8);
        assert_eq!(TypeDesc::reference(TypeDesc::U16).alignment(TransferSyntax::Ndr20), 2);
    }

    #[test]
    fn test_conformant_tail_nested() {
        let inner = TypeDesc::Struct(vec![TypeDesc::U16, TypeDesc::wide_string()]);
        let outer = TypeDesc::Struct(vec![TypeDesc::U32, inner]);
        assert_eq!(outer.conformant_tail(), Some(&TypeDesc::wide_string()));
        let plain = TypeDesc::Struct(vec![TypeDesc::conformant(TypeDesc::U8), TypeDesc::U32]);
        assert!(plain.conformant_tail().is_none());
    }

    #[test]
    fn test_union_default_arm() {
        let u = UnionDesc {
            discriminant: Box::new(TypeDesc::U16),
            cases: vec![(1, Arm::Body(TypeDesc::U32))],
            default: Some(Box::new(Arm::Empty)),
        };
        assert_eq!(u.arm(1), Some(&Arm::Body(TypeDesc::U32)));
        assert_eq!(u.arm(9), Some(&Arm::Empty));
    }
}
