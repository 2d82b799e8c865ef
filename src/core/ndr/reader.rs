//! NDR decoder.
//!
//! Decoding runs in two passes. The first walks the buffer and builds a tree of
//! nodes in which every unique or full pointer is only a referent id; referents
//! are read from a FIFO queue in the same order the encoder deferred them. The
//! second pass resolves ids through an arena of slots, so shared referents
//! become shared `Arc`s and cycles are detected instead of followed.

use super::types::{Arm, ContextHandle, DecodeLimits, PointerKind, TypeDesc, Value};
use crate::core::syntax::{CharacterSet, FloatFormat, NdrFormat, TransferSyntax, Uuid};
use crate::error::DecodeError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type Result<T> = std::result::Result<T, DecodeError>;

enum Node {
    Leaf(Value),
    Struct(Vec<Node>),
    Array(Vec<Node>),
    Union {
        discriminant: i64,
        arm: Option<Box<Node>>,
    },
    Ref(Box<Node>),
    Ptr(Option<u64>),
}

struct Slot<'d> {
    desc: &'d TypeDesc,
    kind: PointerKind,
    node: Option<Node>,
}

/// Streaming NDR decoder over one stub.
pub struct NdrReader<'a, 'd> {
    buf: &'a [u8],
    pos: usize,
    fmt: NdrFormat,
    little: bool,
    limits: DecodeLimits,
    slots: HashMap<u64, Slot<'d>>,
    queue: VecDeque<u64>,
    resolved: HashMap<u64, Arc<Value>>,
}

impl<'a, 'd> NdrReader<'a, 'd> {
    pub fn new(buf: &'a [u8], fmt: &NdrFormat, limits: DecodeLimits) -> Self {
        Self {
            buf,
            pos: 0,
            fmt: *fmt,
            little: fmt.drep.is_little_endian(),
            limits,
            slots: HashMap::new(),
            queue: VecDeque::new(),
            resolved: HashMap::new(),
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read one top-level value and every referent it defers.
    ///
    /// A parameter list is read as a run of top-level values, each followed
    /// by its own referents.
    pub fn read_top(&mut self, desc: &'d TypeDesc) -> Result<Value> {
        let root = match desc {
            TypeDesc::Params(params) => {
                let mut args = Vec::with_capacity(params.len());
                for param in params {
                    args.push(self.read(param, None)?);
                    self.drain_referents()?;
                }
                Node::Struct(args)
            }
            _ => {
                let root = self.read(desc, None)?;
                self.drain_referents()?;
                root
            }
        };
        self.resolve(root, 0)
    }

    fn drain_referents(&mut self) -> Result<()> {
        while let Some(id) = self.queue.pop_front() {
            let referent_desc = match self.slots.get(&id) {
                Some(slot) => slot.desc,
                None => return Err(DecodeError::InvalidDescriptor("referent slot missing")),
            };
            let node = self.read(referent_desc, None)?;
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.node = Some(node);
            }
        }
        Ok(())
    }

    fn truncated(&self, needed: usize) -> DecodeError {
        DecodeError::Truncated {
            offset: self.pos,
            needed,
            available: self.remaining(),
        }
    }

    fn align(&mut self, n: usize) -> Result<()> {
        let pad = (n - self.pos % n) % n;
        if pad > self.remaining() {
            return Err(self.truncated(pad));
        }
        self.pos += pad;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.truncated(n));
        }
        let buf = self.buf;
        let out = &buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let b = self.take_array::<2>()?;
        Ok(if self.little {
            u16::from_le_bytes(b)
        } else {
            u16::from_be_bytes(b)
        })
    }

    fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b = self.take_array::<4>()?;
        Ok(if self.little {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let b = self.take_array::<8>()?;
        Ok(if self.little {
            u64::from_le_bytes(b)
        } else {
            u64::from_be_bytes(b)
        })
    }

    fn get_word(&mut self) -> Result<u64> {
        match self.fmt.syntax {
            TransferSyntax::Ndr20 => self.get_u32().map(u64::from),
            TransferSyntax::Ndr64 => self.get_u64(),
        }
    }

    fn require_ieee(&self) -> Result<()> {
        match self.fmt.drep.float_format() {
            FloatFormat::Ieee => Ok(()),
            _ => Err(DecodeError::UnsupportedRepresentation(
                "only IEEE floating point is supported",
            )),
        }
    }

    fn require_ascii(&self) -> Result<()> {
        match self.fmt.drep.character_set() {
            CharacterSet::Ascii => Ok(()),
            CharacterSet::Ebcdic => Err(DecodeError::UnsupportedRepresentation(
                "EBCDIC characters are not supported",
            )),
        }
    }

    /// Validate a wire-supplied element count before anything is allocated.
    fn check_count(&self, count: u64, elem: &TypeDesc) -> Result<usize> {
        if count > self.limits.max_elements as u64 {
            return Err(DecodeError::CountExceedsLimit {
                count,
                limit: self.limits.max_elements,
            });
        }
        // Zero-sized elements are charged one byte each so the count stays
        // bounded by the input length.
        let min = elem.min_wire_size(self.fmt.syntax).max(1) as u64;
        if count.saturating_mul(min) > self.remaining() as u64 {
            return Err(DecodeError::CountExceedsBuffer {
                count,
                remaining: self.remaining(),
            });
        }
        Ok(count as usize)
    }

    fn read(&mut self, desc: &'d TypeDesc, hoisted: Option<u64>) -> Result<Node> {
        let node = match desc {
            TypeDesc::U8 => Node::Leaf(Value::U8(self.get_u8()?)),
            TypeDesc::I8 => Node::Leaf(Value::I8(self.get_u8()? as i8)),
            TypeDesc::U16 => Node::Leaf(Value::U16(self.get_u16()?)),
            TypeDesc::I16 => Node::Leaf(Value::I16(self.get_u16()? as i16)),
            TypeDesc::U32 => Node::Leaf(Value::U32(self.get_u32()?)),
            TypeDesc::I32 => Node::Leaf(Value::I32(self.get_u32()? as i32)),
            TypeDesc::U64 => Node::Leaf(Value::U64(self.get_u64()?)),
            TypeDesc::I64 => Node::Leaf(Value::I64(self.get_u64()? as i64)),
            TypeDesc::F32 => {
                self.require_ieee()?;
                Node::Leaf(Value::F32(f32::from_bits(self.get_u32()?)))
            }
            TypeDesc::F64 => {
                self.require_ieee()?;
                Node::Leaf(Value::F64(f64::from_bits(self.get_u64()?)))
            }
            TypeDesc::Char => {
                self.require_ascii()?;
                Node::Leaf(Value::Char(self.get_u8()?))
            }
            TypeDesc::WChar => Node::Leaf(Value::WChar(self.get_u16()?)),
            TypeDesc::Uuid => {
                self.align(4)?;
                let bytes = self.take_array::<16>()?;
                Node::Leaf(Value::Uuid(Uuid::from_bytes(&bytes, self.little)))
            }
            TypeDesc::ContextHandle => {
                self.align(4)?;
                Node::Leaf(Value::ContextHandle(ContextHandle(self.take_array()?)))
            }
            TypeDesc::Struct(members) => {
                let has_tail = desc.conformant_tail().is_some();
                let conformance = match (has_tail, hoisted) {
                    (true, None) => Some(self.get_word()?),
                    (true, Some(c)) => Some(c),
                    (false, _) => None,
                };
                self.align(desc.alignment(self.fmt.syntax))?;
                let last = members.len().saturating_sub(1);
                let mut fields = Vec::with_capacity(members.len());
                for (i, member) in members.iter().enumerate() {
                    let hoist = if i == last { conformance } else { None };
                    fields.push(self.read(member, hoist)?);
                }
                Node::Struct(fields)
            }
            TypeDesc::Params(params) => {
                let mut args = Vec::with_capacity(params.len());
                for param in params {
                    args.push(self.read(param, None)?);
                }
                Node::Struct(args)
            }
            TypeDesc::FixedArray(elem, n) => {
                let count = self.check_count(*n as u64, elem)?;
                self.read_elements(elem, count)?
            }
            TypeDesc::ConformantArray(elem) => {
                let max = match hoisted {
                    Some(c) => c,
                    None => self.get_word()?,
                };
                let count = self.check_count(max, elem)?;
                self.read_elements(elem, count)?
            }
            TypeDesc::VaryingArray(elem, declared) => {
                let (offset, actual) = (self.get_word()?, self.get_word()?);
                if actual > *declared as u64 {
                    return Err(DecodeError::ArraySizeMismatch {
                        declared: actual,
                        expected: *declared as u64,
                    });
                }
                check_bounds(offset, actual, *declared as u64)?;
                let count = self.check_count(actual, elem)?;
                self.read_elements(elem, count)?
            }
            TypeDesc::ConformantVaryingArray(elem) => {
                let max = match hoisted {
                    Some(c) => c,
                    None => self.get_word()?,
                };
                let (offset, actual) = (self.get_word()?, self.get_word()?);
                check_bounds(offset, actual, max)?;
                let count = self.check_count(actual, elem)?;
                self.read_elements(elem, count)?
            }
            TypeDesc::String { wide } => Node::Leaf(Value::String(self.read_string(*wide, hoisted)?)),
            TypeDesc::Pointer(PointerKind::Ref, inner) => {
                Node::Ref(Box::new(self.read(inner, None)?))
            }
            TypeDesc::Pointer(kind, inner) => {
                let id = self.get_word()?;
                if id == 0 {
                    Node::Ptr(None)
                } else {
                    self.register_referent(id, *kind, inner)?;
                    Node::Ptr(Some(id))
                }
            }
            TypeDesc::Union(u) => {
                self.align(desc.alignment(self.fmt.syntax))?;
                let discriminant = self.read_discriminant(&u.discriminant)?;
                let arm = match u.arm(discriminant) {
                    None => return Err(DecodeError::UnknownDiscriminant(discriminant)),
                    Some(Arm::Empty) => None,
                    Some(Arm::Body(arm_desc)) => Some(Box::new(self.read(arm_desc, None)?)),
                };
                Node::Union { discriminant, arm }
            }
        };
        Ok(node)
    }

    fn read_elements(&mut self, elem: &'d TypeDesc, count: usize) -> Result<Node> {
        self.align(elem.alignment(self.fmt.syntax))?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read(elem, None)?);
        }
        Ok(Node::Array(items))
    }

    fn read_string(&mut self, wide: bool, hoisted: Option<u64>) -> Result<String> {
        let max = match hoisted {
            Some(c) => c,
            None => self.get_word()?,
        };
        let (offset, actual) = (self.get_word()?, self.get_word()?);
        check_bounds(offset, actual, max)?;
        if actual == 0 {
            return Err(DecodeError::EmptyString);
        }

        if wide {
            let count = self.check_count(actual, &TypeDesc::WChar)?;
            let mut units = Vec::with_capacity(count);
            for _ in 0..count {
                units.push(self.get_u16()?);
            }
            let (terminator, body) = units.split_last().ok_or(DecodeError::EmptyString)?;
            if *terminator != 0 {
                return Err(DecodeError::MissingTerminator);
            }
            if body.contains(&0) {
                return Err(DecodeError::InvalidString);
            }
            String::from_utf16(body).map_err(|_| DecodeError::InvalidString)
        } else {
            self.require_ascii()?;
            let count = self.check_count(actual, &TypeDesc::Char)?;
            let bytes = self.take(count)?;
            let (terminator, body) = bytes.split_last().ok_or(DecodeError::EmptyString)?;
            if *terminator != 0 {
                return Err(DecodeError::MissingTerminator);
            }
            if body.iter().any(|b| *b == 0 || !b.is_ascii()) {
                return Err(DecodeError::InvalidString);
            }
            String::from_utf8(body.to_vec()).map_err(|_| DecodeError::InvalidString)
        }
    }

    fn register_referent(&mut self, id: u64, kind: PointerKind, desc: &'d TypeDesc) -> Result<()> {
        match self.slots.get(&id) {
            None => {
                self.slots.insert(
                    id,
                    Slot {
                        desc,
                        kind,
                        node: None,
                    },
                );
                self.queue.push_back(id);
                Ok(())
            }
            Some(slot) if kind == PointerKind::Unique || slot.kind == PointerKind::Unique => {
                Err(DecodeError::DuplicateReferent(id))
            }
            Some(slot) if slot.desc != desc => Err(DecodeError::ReferentTypeMismatch(id)),
            Some(_) => Ok(()),
        }
    }

    fn read_discriminant(&mut self, desc: &TypeDesc) -> Result<i64> {
        Ok(match desc {
            TypeDesc::U8 => i64::from(self.get_u8()?),
            TypeDesc::I8 => i64::from(self.get_u8()? as i8),
            TypeDesc::U16 => i64::from(self.get_u16()?),
            TypeDesc::I16 => i64::from(self.get_u16()? as i16),
            TypeDesc::U32 => i64::from(self.get_u32()?),
            TypeDesc::I32 => i64::from(self.get_u32()? as i32),
            TypeDesc::U64 => i64::try_from(self.get_u64()?)
                .map_err(|_| DecodeError::OutOfRange("union discriminant"))?,
            TypeDesc::I64 => self.get_u64()? as i64,
            _ => {
                return Err(DecodeError::InvalidDescriptor(
                    "union discriminant must be an integer",
                ))
            }
        })
    }

    fn resolve(&mut self, node: Node, depth: usize) -> Result<Value> {
        Ok(match node {
            Node::Leaf(v) => v,
            Node::Struct(fields) => Value::Struct(self.resolve_all(fields, depth)?),
            Node::Array(items) => Value::Array(self.resolve_all(items, depth)?),
            Node::Union { discriminant, arm } => Value::Union {
                discriminant,
                arm: match arm {
                    Some(inner) => Some(Box::new(self.resolve(*inner, depth)?)),
                    None => None,
                },
            },
            Node::Ref(inner) => Value::Pointer(Some(Arc::new(self.resolve(*inner, depth)?))),
            Node::Ptr(None) => Value::Pointer(None),
            Node::Ptr(Some(id)) => Value::Pointer(Some(self.resolve_referent(id, depth + 1)?)),
        })
    }

    fn resolve_all(&mut self, nodes: Vec<Node>, depth: usize) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            out.push(self.resolve(node, depth)?);
        }
        Ok(out)
    }

    fn resolve_referent(&mut self, id: u64, depth: usize) -> Result<Arc<Value>> {
        if depth > self.limits.max_depth {
            return Err(DecodeError::DepthExceeded(self.limits.max_depth));
        }
        if let Some(value) = self.resolved.get(&id) {
            return Ok(Arc::clone(value));
        }
        // A slot whose node was already taken but is not resolved yet is on
        // the current resolution path.
        let node = self
            .slots
            .get_mut(&id)
            .and_then(|slot| slot.node.take())
            .ok_or(DecodeError::CyclicReference(id))?;
        let value = Arc::new(self.resolve(node, depth)?);
        self.resolved.insert(id, Arc::clone(&value));
        Ok(value)
    }
}

fn check_bounds(offset: u64, actual: u64, max: u64) -> Result<()> {
    match offset.checked_add(actual) {
        Some(end) if end <= max => Ok(()),
        _ => Err(DecodeError::InconsistentBounds {
            offset,
            actual,
            max,
        }),
    }
}
