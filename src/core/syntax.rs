//! Identifiers and data-representation labels shared by the codec and the PDU layer.
//!
//! An interface or transfer syntax is named by a [`SyntaxId`]: a UUID plus a
//! 32-bit version (major in the low half, minor in the high half). The
//! [`DataRepresentation`] label travels in every PDU header and tells the
//! receiver how the sender laid out integers, characters and floats.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A DCE UUID in its structured form.
///
/// On the wire the first three fields follow the sender's integer order while
/// `data4` is always a plain byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Uuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Uuid {
    pub const NIL: Uuid = Uuid::from_fields(0, 0, 0, [0; 8]);

    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Encode the 16-byte wire form using the given integer order.
    pub fn to_bytes(&self, little: bool) -> [u8; 16] {
        let mut out = [0u8; 16];
        if little {
            out[0..4].copy_from_slice(&self.data1.to_le_bytes());
            out[4..6].copy_from_slice(&self.data2.to_le_bytes());
            out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        } else {
            out[0..4].copy_from_slice(&self.data1.to_be_bytes());
            out[4..6].copy_from_slice(&self.data2.to_be_bytes());
            out[6..8].copy_from_slice(&self.data3.to_be_bytes());
        }
        out[8..16].copy_from_slice(&self.data4);
        out
    }

    pub fn from_bytes(bytes: &[u8; 16], little: bool) -> Self {
        let d1 = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let d2 = [bytes[4], bytes[5]];
        let d3 = [bytes[6], bytes[7]];
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..16]);
        if little {
            Self::from_fields(
                u32::from_le_bytes(d1),
                u16::from_le_bytes(d2),
                u16::from_le_bytes(d3),
                data4,
            )
        } else {
            Self::from_fields(
                u32::from_be_bytes(d1),
                u16::from_be_bytes(d2),
                u16::from_be_bytes(d3),
                data4,
            )
        }
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl FromStr for Uuid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProtocolError::Custom(format!("invalid UUID: '{s}'"));

        let parts: Vec<&str> = s.split('-').collect();
        let expected = [8usize, 4, 4, 4, 12];
        if parts.len() != expected.len()
            || parts.iter().zip(expected).any(|(p, n)| p.len() != n)
        {
            return Err(invalid());
        }

        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| invalid())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| invalid())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| invalid())?;

        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = tail
                .get(i * 2..i * 2 + 2)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(invalid)?;
        }

        Ok(Self::from_fields(data1, data2, data3, data4))
    }
}

/// Interface or transfer syntax identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32,
}

impl SyntaxId {
    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major(&self) -> u16 {
        (self.version & 0xFFFF) as u16
    }

    pub fn minor(&self) -> u16 {
        (self.version >> 16) as u16
    }

    /// Wire size: UUID plus 32-bit version.
    pub const SIZE: usize = 20;
}

impl fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{}", self.uuid, self.major(), self.minor())
    }
}

/// NDR 2.0 transfer syntax identifier.
pub const NDR20_SYNTAX: SyntaxId = SyntaxId::new(
    Uuid::from_fields(
        0x8a88_5d04,
        0x1ceb,
        0x11c9,
        [0x9f, 0xe8, 0x08, 0x00, 0x2b, 0x10, 0x48, 0x60],
    ),
    2,
    0,
);

/// NDR64 transfer syntax identifier.
pub const NDR64_SYNTAX: SyntaxId = SyntaxId::new(
    Uuid::from_fields(
        0x7171_0533,
        0xbeba,
        0x4937,
        [0x83, 0x19, 0xb5, 0xdb, 0xef, 0x9c, 0xcc, 0x36],
    ),
    1,
    0,
);

/// Transfer syntaxes the codec can produce and consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferSyntax {
    Ndr20,
    Ndr64,
}

impl TransferSyntax {
    pub fn syntax_id(self) -> SyntaxId {
        match self {
            TransferSyntax::Ndr20 => NDR20_SYNTAX,
            TransferSyntax::Ndr64 => NDR64_SYNTAX,
        }
    }

    pub fn from_syntax_id(id: &SyntaxId) -> Option<Self> {
        if *id == NDR20_SYNTAX {
            Some(TransferSyntax::Ndr20)
        } else if *id == NDR64_SYNTAX {
            Some(TransferSyntax::Ndr64)
        } else {
            None
        }
    }

    /// Width in bytes of conformance, variance and referent-id fields.
    #[inline]
    pub fn word_size(self) -> usize {
        match self {
            TransferSyntax::Ndr20 => 4,
            TransferSyntax::Ndr64 => 8,
        }
    }
}

/// Integer byte order advertised in the data representation label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegerOrder {
    Big,
    Little,
}

/// Character set advertised in the data representation label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
    Ascii,
    Ebcdic,
}

/// Floating-point format advertised in the data representation label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatFormat {
    Ieee,
    Vax,
    Cray,
    Ibm,
    Unknown(u8),
}

/// The 4-byte data representation label carried in every PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataRepresentation(pub [u8; 4]);

impl DataRepresentation {
    /// Little-endian integers, ASCII characters, IEEE floats.
    pub const LITTLE_ENDIAN: DataRepresentation = DataRepresentation([0x10, 0, 0, 0]);
    /// Big-endian integers, ASCII characters, IEEE floats.
    pub const BIG_ENDIAN: DataRepresentation = DataRepresentation([0x00, 0, 0, 0]);

    pub fn new(order: IntegerOrder) -> Self {
        match order {
            IntegerOrder::Little => Self::LITTLE_ENDIAN,
            IntegerOrder::Big => Self::BIG_ENDIAN,
        }
    }

    #[inline]
    pub fn integer_order(&self) -> IntegerOrder {
        if self.0[0] & 0xF0 == 0x10 {
            IntegerOrder::Little
        } else {
            IntegerOrder::Big
        }
    }

    #[inline]
    pub fn is_little_endian(&self) -> bool {
        self.integer_order() == IntegerOrder::Little
    }

    pub fn character_set(&self) -> CharacterSet {
        if self.0[0] & 0x0F == 0 {
            CharacterSet::Ascii
        } else {
            CharacterSet::Ebcdic
        }
    }

    pub fn float_format(&self) -> FloatFormat {
        match self.0[1] {
            0 => FloatFormat::Ieee,
            1 => FloatFormat::Vax,
            2 => FloatFormat::Cray,
            3 => FloatFormat::Ibm,
            other => FloatFormat::Unknown(other),
        }
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::LITTLE_ENDIAN
    }
}

/// Everything the codec needs to know about the wire layout of one stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdrFormat {
    pub syntax: TransferSyntax,
    pub drep: DataRepresentation,
}

impl NdrFormat {
    pub const fn new(syntax: TransferSyntax, drep: DataRepresentation) -> Self {
        Self { syntax, drep }
    }

    pub const fn ndr20() -> Self {
        Self::new(TransferSyntax::Ndr20, DataRepresentation::LITTLE_ENDIAN)
    }

    pub const fn ndr64() -> Self {
        Self::new(TransferSyntax::Ndr64, DataRepresentation::LITTLE_ENDIAN)
    }
}

impl Default for NdrFormat {
    fn default() -> Self {
        Self::ndr20()
    }
}
