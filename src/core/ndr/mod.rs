//! # NDR Codec
//!
//! Converts [`Value`]s to and from the Network Data Representation used in
//! request and response stubs.
//!
//! ## Wire Rules
//! - Scalars are aligned to their own size, relative to the start of the stub
//! - Conformant arrays carry a maximum count, varying arrays an offset and actual count
//! - A structure ending in a conformant array writes that count before the structure
//! - Unique and full pointers write a referent id; referents follow in FIFO order
//! - Full pointers to the same `Arc` share one id and one embedded referent
//!
//! ## Security
//! - Every count read from the wire is checked against [`DecodeLimits`] and the
//!   remaining input before any element is allocated
//! - Pointer resolution is iterative over an arena of referent slots with a
//!   depth ceiling; cycles are an error

mod reader;
mod typed;
mod types;
mod writer;

pub use reader::NdrReader;
pub use typed::{from_ndr, to_ndr, NdrType};
pub use types::{Arm, ContextHandle, DecodeLimits, PointerKind, TypeDesc, UnionDesc, Value};
pub use writer::NdrWriter;

use crate::core::syntax::NdrFormat;
use crate::error::{DecodeError, EncodeError};

/// Referent ids start here and advance by four.
pub const FIRST_REFERENT_ID: u64 = 0x0002_0000;

/// Encode `value` as a single top-level stub.
pub fn encode(value: &Value, desc: &TypeDesc, fmt: &NdrFormat) -> Result<Vec<u8>, EncodeError> {
    let mut writer = NdrWriter::new(fmt);
    writer.write_top(value, desc)?;
    Ok(writer.finish())
}

/// Decode a complete stub holding exactly one top-level value.
pub fn decode(bytes: &[u8], desc: &TypeDesc, fmt: &NdrFormat) -> Result<Value, DecodeError> {
    decode_with_limits(bytes, desc, fmt, DecodeLimits::default())
}

pub fn decode_with_limits(
    bytes: &[u8],
    desc: &TypeDesc,
    fmt: &NdrFormat,
    limits: DecodeLimits,
) -> Result<Value, DecodeError> {
    let mut reader = NdrReader::new(bytes, fmt, limits);
    let value = reader.read_top(desc)?;
    match reader.remaining() {
        0 => Ok(value),
        n => Err(DecodeError::TrailingBytes(n)),
    }
}
