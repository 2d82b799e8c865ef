//! NDR encoder.
//!
//! Values are written depth-first. Unique and full pointer referents are queued
//! and written in FIFO order once the enclosing top-level value is complete.

use super::types::{Arm, PointerKind, TypeDesc, Value};
use super::FIRST_REFERENT_ID;
use crate::core::syntax::{CharacterSet, FloatFormat, NdrFormat, TransferSyntax};
use crate::error::EncodeError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type Result<T> = std::result::Result<T, EncodeError>;

/// Streaming NDR encoder for one stub.
pub struct NdrWriter<'d> {
    buf: Vec<u8>,
    fmt: NdrFormat,
    little: bool,
    next_referent: u64,
    deferred: VecDeque<(Arc<Value>, &'d TypeDesc)>,
    full_referents: HashMap<*const Value, u64>,
}

impl<'d> NdrWriter<'d> {
    pub fn new(fmt: &NdrFormat) -> Self {
        Self {
            buf: Vec::new(),
            fmt: *fmt,
            little: fmt.drep.is_little_endian(),
            next_referent: FIRST_REFERENT_ID,
            deferred: VecDeque::new(),
            full_referents: HashMap::new(),
        }
    }

    /// Write one top-level value followed by every referent it deferred.
    ///
    /// A parameter list is written as a run of top-level values, each
    /// followed by its own referents.
    pub fn write_top(&mut self, value: &Value, desc: &'d TypeDesc) -> Result<()> {
        match (desc, value) {
            (TypeDesc::Params(params), Value::Struct(args)) => {
                if params.len() != args.len() {
                    return Err(EncodeError::TypeMismatch {
                        expected: desc.name(),
                    });
                }
                for (param, arg) in params.iter().zip(args) {
                    self.write(arg, param, false)?;
                    self.flush_deferred()?;
                }
                Ok(())
            }
            _ => {
                self.write(value, desc, false)?;
                self.flush_deferred()
            }
        }
    }

    fn flush_deferred(&mut self) -> Result<()> {
        while let Some((referent, desc)) = self.deferred.pop_front() {
            self.write(&referent, desc, false)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    #[inline]
    fn align(&mut self, n: usize) {
        let rem = self.buf.len() % n;
        if rem != 0 {
            self.buf.resize(self.buf.len() + (n - rem), 0);
        }
    }

    fn put_u16(&mut self, v: u16) {
        self.align(2);
        if self.little {
            self.buf.extend_from_slice(&v.to_le_bytes());
        } else {
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.align(4);
        if self.little {
            self.buf.extend_from_slice(&v.to_le_bytes());
        } else {
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    fn put_u64(&mut self, v: u64) {
        self.align(8);
        if self.little {
            self.buf.extend_from_slice(&v.to_le_bytes());
        } else {
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    /// Conformance, variance and referent-id fields.
    fn put_word(&mut self, v: u64) -> Result<()> {
        match self.fmt.syntax {
            TransferSyntax::Ndr20 => {
                let v = u32::try_from(v).map_err(|_| EncodeError::CountOverflow(v as usize))?;
                self.put_u32(v);
            }
            TransferSyntax::Ndr64 => self.put_u64(v),
        }
        Ok(())
    }

    fn put_count(&mut self, n: usize) -> Result<()> {
        self.put_word(n as u64)
    }

    fn require_ieee(&self) -> Result<()> {
        match self.fmt.drep.float_format() {
            FloatFormat::Ieee => Ok(()),
            _ => Err(EncodeError::UnsupportedRepresentation(
                "only IEEE floating point is supported",
            )),
        }
    }

    fn require_ascii(&self) -> Result<()> {
        match self.fmt.drep.character_set() {
            CharacterSet::Ascii => Ok(()),
            CharacterSet::Ebcdic => Err(EncodeError::UnsupportedRepresentation(
                "EBCDIC characters are not supported",
            )),
        }
    }

    fn allocate_referent(&mut self) -> Result<u64> {
        let id = self.next_referent;
        self.next_referent = id
            .checked_add(4)
            .ok_or(EncodeError::CountOverflow(id as usize))?;
        Ok(id)
    }

    fn write(&mut self, value: &Value, desc: &'d TypeDesc, hoisted: bool) -> Result<()> {
        let mismatch = || EncodeError::TypeMismatch {
            expected: desc.name(),
        };

        match (desc, value) {
            (TypeDesc::U8, Value::U8(v)) => self.buf.push(*v),
            (TypeDesc::I8, Value::I8(v)) => self.buf.push(*v as u8),
            (TypeDesc::U16, Value::U16(v)) => self.put_u16(*v),
            (TypeDesc::I16, Value::I16(v)) => self.put_u16(*v as u16),
            (TypeDesc::U32, Value::U32(v)) => self.put_u32(*v),
            (TypeDesc::I32, Value::I32(v)) => self.put_u32(*v as u32),
            (TypeDesc::U64, Value::U64(v)) => self.put_u64(*v),
            (TypeDesc::I64, Value::I64(v)) => self.put_u64(*v as u64),
            (TypeDesc::F32, Value::F32(v)) => {
                self.require_ieee()?;
                self.put_u32(v.to_bits());
            }
            (TypeDesc::F64, Value::F64(v)) => {
                self.require_ieee()?;
                self.put_u64(v.to_bits());
            }
            (TypeDesc::Char, Value::Char(c)) => {
                self.require_ascii()?;
                self.buf.push(*c);
            }
            (TypeDesc::WChar, Value::WChar(c)) => self.put_u16(*c),
            (TypeDesc::Uuid, Value::Uuid(u)) => {
                self.align(4);
                let bytes = u.to_bytes(self.little);
                self.buf.extend_from_slice(&bytes);
            }
            (TypeDesc::ContextHandle, Value::ContextHandle(h)) => {
                self.align(4);
                self.buf.extend_from_slice(&h.0);
            }
            (TypeDesc::Struct(members), Value::Struct(fields)) => {
                if members.len() != fields.len() {
                    return Err(mismatch());
                }
                let has_tail = desc.conformant_tail().is_some();
                if has_tail && !hoisted {
                    let count = tail_count(value, desc)?;
                    self.put_count(count)?;
                }
                self.align(desc.alignment(self.fmt.syntax));
                let last = members.len().saturating_sub(1);
                for (i, (member, field)) in members.iter().zip(fields).enumerate() {
                    self.write(field, member, has_tail && i == last)?;
                }
            }
            (TypeDesc::Params(params), Value::Struct(args)) => {
                if params.len() != args.len() {
                    return Err(mismatch());
                }
                for (param, arg) in params.iter().zip(args) {
                    self.write(arg, param, false)?;
                }
            }
            (TypeDesc::FixedArray(elem, n), Value::Array(items)) => {
                if items.len() != *n {
                    return Err(EncodeError::FixedArrayLength {
                        expected: *n,
                        actual: items.len(),
                    });
                }
                self.write_elements(items, elem)?;
            }
            (TypeDesc::ConformantArray(elem), Value::Array(items)) => {
                if !hoisted {
                    self.put_count(items.len())?;
                }
                self.write_elements(items, elem)?;
            }
            (TypeDesc::VaryingArray(elem, max), Value::Array(items)) => {
                if items.len() > *max {
                    return Err(EncodeError::VaryingArrayOverflow {
                        max: *max,
                        actual: items.len(),
                    });
                }
                self.put_count(0)?;
                self.put_count(items.len())?;
                self.write_elements(items, elem)?;
            }
            (TypeDesc::ConformantVaryingArray(elem), Value::Array(items)) => {
                if !hoisted {
                    self.put_count(items.len())?;
                }
                self.put_count(0)?;
                self.put_count(items.len())?;
                self.write_elements(items, elem)?;
            }
            (TypeDesc::String { wide }, Value::String(s)) => {
                if *wide {
                    let units = wide_units(s)?;
                    let count = units.len() + 1;
                    self.write_string_header(count, hoisted)?;
                    for unit in units {
                        self.put_u16(unit);
                    }
                    self.put_u16(0);
                } else {
                    self.require_ascii()?;
                    let bytes = narrow_units(s)?;
                    let count = bytes.len() + 1;
                    self.write_string_header(count, hoisted)?;
                    self.buf.extend_from_slice(bytes);
                    self.buf.push(0);
                }
            }
            (TypeDesc::Pointer(kind, inner), Value::Pointer(target)) => {
                self.write_pointer(*kind, inner, target.as_ref())?;
            }
            (TypeDesc::Union(u), Value::Union { discriminant, arm }) => {
                let selected = u
                    .arm(*discriminant)
                    .ok_or(EncodeError::UnknownDiscriminant(*discriminant))?;
                self.align(desc.alignment(self.fmt.syntax));
                self.write_discriminant(*discriminant, &u.discriminant)?;
                match (selected, arm) {
                    (Arm::Empty, None) => {}
                    (Arm::Body(arm_desc), Some(arm_value)) => {
                        self.write(arm_value, arm_desc, false)?;
                    }
                    _ => {
                        return Err(EncodeError::TypeMismatch {
                            expected: "union arm",
                        })
                    }
                }
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    fn write_elements(&mut self, items: &[Value], elem: &'d TypeDesc) -> Result<()> {
        self.align(elem.alignment(self.fmt.syntax));
        for item in items {
            self.write(item, elem, false)?;
        }
        Ok(())
    }

    fn write_string_header(&mut self, count: usize, hoisted: bool) -> Result<()> {
        if !hoisted {
            self.put_count(count)?;
        }
        self.put_count(0)?;
        self.put_count(count)
    }

    fn write_pointer(
        &mut self,
        kind: PointerKind,
        inner: &'d TypeDesc,
        target: Option<&Arc<Value>>,
    ) -> Result<()> {
        match (kind, target) {
            (PointerKind::Ref, None) => Err(EncodeError::NullReference),
            (PointerKind::Ref, Some(v)) => self.write(v, inner, false),
            (_, None) => self.put_word(0),
            (PointerKind::Unique, Some(v)) => {
                let id = self.allocate_referent()?;
                self.put_word(id)?;
                self.deferred.push_back((Arc::clone(v), inner));
                Ok(())
            }
            (PointerKind::Full, Some(v)) => {
                let key = Arc::as_ptr(v);
                if let Some(id) = self.full_referents.get(&key) {
                    return self.put_word(*id);
                }
                let id = self.allocate_referent()?;
                self.full_referents.insert(key, id);
                self.put_word(id)?;
                self.deferred.push_back((Arc::clone(v), inner));
                Ok(())
            }
        }
    }

    fn write_discriminant(&mut self, d: i64, desc: &TypeDesc) -> Result<()> {
        let range = || EncodeError::OutOfRange("union discriminant");
        match desc {
            TypeDesc::U8 => self.buf.push(u8::try_from(d).map_err(|_| range())?),
            TypeDesc::I8 => self.buf.push(i8::try_from(d).map_err(|_| range())? as u8),
            TypeDesc::U16 => self.put_u16(u16::try_from(d).map_err(|_| range())?),
            TypeDesc::I16 => self.put_u16(i16::try_from(d).map_err(|_| range())? as u16),
            TypeDesc::U32 => self.put_u32(u32::try_from(d).map_err(|_| range())?),
            TypeDesc::I32 => self.put_u32(i32::try_from(d).map_err(|_| range())? as u32),
            TypeDesc::U64 => self.put_u64(u64::try_from(d).map_err(|_| range())?),
            TypeDesc::I64 => self.put_u64(d as u64),
            _ => {
                return Err(EncodeError::InvalidDescriptor(
                    "union discriminant must be an integer",
                ))
            }
        }
        Ok(())
    }
}

/// Conformance of the trailing array a structure hoists.
fn tail_count(value: &Value, desc: &TypeDesc) -> Result<usize> {
    match (desc, value) {
        (TypeDesc::Struct(members), Value::Struct(fields)) => match (members.last(), fields.last())
        {
            (Some(m), Some(f)) => tail_count(f, m),
            _ => Err(EncodeError::TypeMismatch { expected: "struct" }),
        },
        (TypeDesc::ConformantArray(_), Value::Array(items))
        | (TypeDesc::ConformantVaryingArray(_), Value::Array(items)) => Ok(items.len()),
        (TypeDesc::String { wide: true }, Value::String(s)) => Ok(wide_units(s)?.len() + 1),
        (TypeDesc::String { wide: false }, Value::String(s)) => Ok(narrow_units(s)?.len() + 1),
        _ => Err(EncodeError::TypeMismatch {
            expected: desc.name(),
        }),
    }
}

fn wide_units(s: &str) -> Result<Vec<u16>> {
    let units: Vec<u16> = s.encode_utf16().collect();
    if units.contains(&0) {
        return Err(EncodeError::InteriorTerminator);
    }
    Ok(units)
}

fn narrow_units(s: &str) -> Result<&[u8]> {
    for c in s.chars() {
        if c == '\0' {
            return Err(EncodeError::InteriorTerminator);
        }
        if !c.is_ascii() {
            return Err(EncodeError::NonAsciiCharacter);
        }
    }
    Ok(s.as_bytes())
}
