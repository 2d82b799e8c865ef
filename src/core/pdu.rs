//! # Connection-Oriented PDUs
//!
//! Wire layout of DCE/RPC v5.0 connection-oriented PDUs.
//!
//! ## Wire Format
//! ```text
//! [vers(1)=5] [minor(1)=0] [ptype(1)] [flags(1)] [drep(4)]
//! [frag_length(2)] [auth_length(2)] [call_id(4)]
//! [body ...] [auth pad] [auth trailer(8)] [verifier(auth_length)]
//! ```
//!
//! Multi-byte header and body fields follow the integer order of the sender's
//! data representation label. The authentication trailer starts on a 4-byte
//! boundary and its `auth_length` counts only the verifier.

use crate::core::syntax::{DataRepresentation, SyntaxId, Uuid};
use crate::error::{constants, EncodeError, ProtocolError, Result};
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use std::ops::Range;

pub const RPC_VERSION: u8 = 5;
pub const RPC_VERSION_MINOR: u8 = 0;
pub const HEADER_SIZE: usize = 16;
pub const AUTH_TRAILER_SIZE: usize = 8;
/// Every implementation must accept fragments at least this large.
pub const MUST_RECV_FRAG_SIZE: u16 = 1432;
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// Request and response body prefix: alloc hint, context id, opnum or cancel count.
pub const REQUEST_PREFIX_SIZE: usize = 8;
pub const RESPONSE_PREFIX_SIZE: usize = 8;
pub const FAULT_BODY_SIZE: usize = 16;

/// Well-known fault statuses.
pub mod fault {
    pub const NCA_S_OP_RNG_ERROR: u32 = 0x1C01_0002;
    pub const NCA_S_UNK_IF: u32 = 0x1C01_0003;
    pub const NCA_S_PROTO_ERROR: u32 = 0x1C01_000B;
    pub const NCA_S_FAULT_CONTEXT_MISMATCH: u32 = 0x1C00_001A;
    pub const NCA_S_FAULT_UNSPEC: u32 = 0x1C00_0012;
    pub const RPC_X_BAD_STUB_DATA: u32 = 0x0000_06F7;
    pub const ACCESS_DENIED: u32 = 0x0000_0005;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResponse = 15,
    Auth3 = 16,
    Shutdown = 17,
    CoCancel = 18,
    Orphaned = 19,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PacketType::Request,
            2 => PacketType::Response,
            3 => PacketType::Fault,
            11 => PacketType::Bind,
            12 => PacketType::BindAck,
            13 => PacketType::BindNak,
            14 => PacketType::AlterContext,
            15 => PacketType::AlterContextResponse,
            16 => PacketType::Auth3,
            17 => PacketType::Shutdown,
            18 => PacketType::CoCancel,
            19 => PacketType::Orphaned,
            _ => return Err(ProtocolError::UnexpectedMessage),
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const FIRST_FRAG = 0x01;
        const LAST_FRAG = 0x02;
        const PENDING_CANCEL = 0x04;
        const SUPPORT_HEADER_SIGN = 0x04;
        const CONC_MPX = 0x10;
        const DID_NOT_EXECUTE = 0x20;
        const MAYBE = 0x40;
        const OBJECT_UUID = 0x80;
    }
}

impl PacketFlags {
    pub fn single() -> Self {
        PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG
    }
}

/// Outcome of one presentation context in a bind acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOutcome {
    Accepted,
    UserRejected,
    ProviderRejected,
    NegotiateAck,
    Other(u16),
}

impl From<u16> for ContextOutcome {
    fn from(v: u16) -> Self {
        match v {
            0 => ContextOutcome::Accepted,
            1 => ContextOutcome::UserRejected,
            2 => ContextOutcome::ProviderRejected,
            3 => ContextOutcome::NegotiateAck,
            other => ContextOutcome::Other(other),
        }
    }
}

impl From<ContextOutcome> for u16 {
    fn from(v: ContextOutcome) -> Self {
        match v {
            ContextOutcome::Accepted => 0,
            ContextOutcome::UserRejected => 1,
            ContextOutcome::ProviderRejected => 2,
            ContextOutcome::NegotiateAck => 3,
            ContextOutcome::Other(other) => other,
        }
    }
}

/// Why a presentation context was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderReason {
    NotSpecified,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
    LocalLimitExceeded,
    Other(u16),
}

impl From<u16> for ProviderReason {
    fn from(v: u16) -> Self {
        match v {
            0 => ProviderReason::NotSpecified,
            1 => ProviderReason::AbstractSyntaxNotSupported,
            2 => ProviderReason::TransferSyntaxesNotSupported,
            3 => ProviderReason::LocalLimitExceeded,
            other => ProviderReason::Other(other),
        }
    }
}

impl From<ProviderReason> for u16 {
    fn from(v: ProviderReason) -> Self {
        match v {
            ProviderReason::NotSpecified => 0,
            ProviderReason::AbstractSyntaxNotSupported => 1,
            ProviderReason::TransferSyntaxesNotSupported => 2,
            ProviderReason::LocalLimitExceeded => 3,
            ProviderReason::Other(other) => other,
        }
    }
}

/// Why a whole bind was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindNakReason {
    NotSpecified,
    TemporaryCongestion,
    LocalLimitExceeded,
    ProtocolVersionNotSupported,
    AuthenticationTypeNotRecognized,
    InvalidChecksum,
    Other(u16),
}

impl From<u16> for BindNakReason {
    fn from(v: u16) -> Self {
        match v {
            0 => BindNakReason::NotSpecified,
            1 => BindNakReason::TemporaryCongestion,
            2 => BindNakReason::LocalLimitExceeded,
            4 => BindNakReason::ProtocolVersionNotSupported,
            8 => BindNakReason::AuthenticationTypeNotRecognized,
            9 => BindNakReason::InvalidChecksum,
            other => BindNakReason::Other(other),
        }
    }
}

impl From<BindNakReason> for u16 {
    fn from(v: BindNakReason) -> Self {
        match v {
            BindNakReason::NotSpecified => 0,
            BindNakReason::TemporaryCongestion => 1,
            BindNakReason::LocalLimitExceeded => 2,
            BindNakReason::ProtocolVersionNotSupported => 4,
            BindNakReason::AuthenticationTypeNotRecognized => 8,
            BindNakReason::InvalidChecksum => 9,
            BindNakReason::Other(other) => other,
        }
    }
}

/// Common 16-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub ptype: PacketType,
    pub flags: PacketFlags,
    pub drep: DataRepresentation,
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    /// Parse the header at the start of `buf`.
    ///
    /// Only the header itself is examined; callers that hold the whole fragment
    /// use [`PduHeader::parse_fragment`] to also check the length fields.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        if buf[0] != RPC_VERSION || buf[1] != RPC_VERSION_MINOR {
            return Err(ProtocolError::UnsupportedVersion(buf[0], buf[1]));
        }
        let ptype = PacketType::try_from(buf[2])?;
        let flags = PacketFlags::from_bits_retain(buf[3]);
        let drep = DataRepresentation([buf[4], buf[5], buf[6], buf[7]]);
        let little = drep.is_little_endian();
        let frag_length = read_u16(&buf[8..10], little);
        let auth_length = read_u16(&buf[10..12], little);
        let call_id = read_u32(&buf[12..16], little);
        if (frag_length as usize) < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(Self {
            ptype,
            flags,
            drep,
            frag_length,
            auth_length,
            call_id,
        })
    }

    pub fn parse_fragment(frag: &[u8]) -> Result<Self> {
        let header = Self::parse(frag)?;
        if header.frag_length as usize != frag.len() {
            return Err(ProtocolError::FramingError(constants::ERR_FRAG_LENGTH.into()));
        }
        if header.auth_length > 0
            && header.auth_length as usize + AUTH_TRAILER_SIZE + HEADER_SIZE > frag.len()
        {
            return Err(ProtocolError::FramingError(constants::ERR_AUTH_LENGTH.into()));
        }
        Ok(header)
    }

    fn write(&self, buf: &mut BytesMut) {
        let little = self.drep.is_little_endian();
        buf.put_u8(RPC_VERSION);
        buf.put_u8(RPC_VERSION_MINOR);
        buf.put_u8(self.ptype as u8);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.drep.0);
        put_u16(buf, self.frag_length, little);
        put_u16(buf, self.auth_length, little);
        put_u32(buf, self.call_id, little);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object: Option<Uuid>,
    pub stub: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultPdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub flags: u8,
    pub status: u32,
}

/// One presentation context proposed in a bind or alter-context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub contexts: Vec<ContextElement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextResult {
    pub outcome: ContextOutcome,
    pub reason: ProviderReason,
    pub transfer_syntax: SyntaxId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAckPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Secondary address (port spec) without its terminator.
    pub secondary_address: String,
    pub results: Vec<ContextResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindNakPdu {
    pub reason: BindNakReason,
    pub versions: Vec<(u8, u8)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody {
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    AlterContext(BindPdu),
    AlterContextResponse(BindAckPdu),
    Auth3,
    Shutdown,
    CoCancel,
    Orphaned,
}

impl PduBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PduBody::Request(_) => PacketType::Request,
            PduBody::Response(_) => PacketType::Response,
            PduBody::Fault(_) => PacketType::Fault,
            PduBody::Bind(_) => PacketType::Bind,
            PduBody::BindAck(_) => PacketType::BindAck,
            PduBody::BindNak(_) => PacketType::BindNak,
            PduBody::AlterContext(_) => PacketType::AlterContext,
            PduBody::AlterContextResponse(_) => PacketType::AlterContextResponse,
            PduBody::Auth3 => PacketType::Auth3,
            PduBody::Shutdown => PacketType::Shutdown,
            PduBody::CoCancel => PacketType::CoCancel,
            PduBody::Orphaned => PacketType::Orphaned,
        }
    }
}

/// Authentication trailer plus verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTrailer {
    pub auth_type: u8,
    pub auth_level: u8,
    pub pad_length: u8,
    pub context_id: u32,
    pub verifier: Bytes,
}

/// A complete fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub flags: PacketFlags,
    pub drep: DataRepresentation,
    pub call_id: u32,
    pub body: PduBody,
    pub auth: Option<AuthTrailer>,
}

impl Pdu {
    pub fn new(call_id: u32, drep: DataRepresentation, body: PduBody) -> Self {
        Self {
            flags: PacketFlags::single(),
            drep,
            call_id,
            body,
            auth: None,
        }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_auth(mut self, auth: AuthTrailer) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    /// Serialize into one fragment. The trailer's pad length is computed here.
    pub fn encode(&self) -> Result<BytesMut> {
        let little = self.drep.is_little_endian();
        let mut flags = self.flags;
        if let PduBody::Request(req) = &self.body {
            flags.set(PacketFlags::OBJECT_UUID, req.object.is_some());
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_bytes(0, HEADER_SIZE);
        encode_body(&self.body, &mut buf, little)?;

        let mut auth_length = 0u16;
        if let Some(auth) = &self.auth {
            let pad = (4 - buf.len() % 4) % 4;
            buf.put_bytes(0, pad);
            buf.put_u8(auth.auth_type);
            buf.put_u8(auth.auth_level);
            buf.put_u8(pad as u8);
            buf.put_u8(0);
            put_u32(&mut buf, auth.context_id, little);
            buf.put_slice(&auth.verifier);
            auth_length = u16::try_from(auth.verifier.len())
                .map_err(|_| ProtocolError::OversizedFragment(auth.verifier.len()))?;
        }

        let frag_length =
            u16::try_from(buf.len()).map_err(|_| ProtocolError::OversizedFragment(buf.len()))?;
        let header = PduHeader {
            ptype: self.packet_type(),
            flags,
            drep: self.drep,
            frag_length,
            auth_length,
            call_id: self.call_id,
        };
        let mut head = BytesMut::with_capacity(HEADER_SIZE);
        header.write(&mut head);
        buf[..HEADER_SIZE].copy_from_slice(&head);
        Ok(buf)
    }

    /// Parse one complete fragment.
    pub fn decode(frag: &[u8]) -> Result<Self> {
        let header = PduHeader::parse_fragment(frag)?;
        let little = header.drep.is_little_endian();

        let (body_end, auth) = if header.auth_length > 0 {
            let trailer_start = frag.len() - header.auth_length as usize - AUTH_TRAILER_SIZE;
            let t = &frag[trailer_start..];
            let pad_length = t[2];
            let body_end = trailer_start
                .checked_sub(pad_length as usize)
                .filter(|end| *end >= HEADER_SIZE)
                .ok_or_else(|| ProtocolError::FramingError(constants::ERR_AUTH_LENGTH.into()))?;
            let auth = AuthTrailer {
                auth_type: t[0],
                auth_level: t[1],
                pad_length,
                context_id: read_u32(&t[4..8], little),
                verifier: Bytes::copy_from_slice(&t[AUTH_TRAILER_SIZE..]),
            };
            (body_end, Some(auth))
        } else {
            (frag.len(), None)
        };

        let mut r = BodyReader::new(&frag[..body_end], HEADER_SIZE, little);
        let body = decode_body(&header, &mut r)?;

        Ok(Self {
            flags: header.flags,
            drep: header.drep,
            call_id: header.call_id,
            body,
            auth,
        })
    }
}

/// Byte ranges of a protected fragment, as seen by the security layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthLayout {
    /// Stub data plus auth padding; the region sealed at privacy level.
    pub payload: Range<usize>,
    /// Start of the 8-byte trailer header.
    pub trailer: usize,
    pub verifier: Range<usize>,
}

impl AuthLayout {
    /// Locate the protected regions of a fragment that carries a trailer.
    pub fn locate(frag: &[u8]) -> Result<Option<Self>> {
        let header = PduHeader::parse_fragment(frag)?;
        if header.auth_length == 0 {
            return Ok(None);
        }
        let prefix = body_prefix_len(&header);
        let verifier_start = frag.len() - header.auth_length as usize;
        let trailer = verifier_start - AUTH_TRAILER_SIZE;
        let payload_start = HEADER_SIZE + prefix;
        if payload_start > trailer {
            return Err(ProtocolError::FramingError(constants::ERR_AUTH_LENGTH.into()));
        }
        Ok(Some(Self {
            payload: payload_start..trailer,
            trailer,
            verifier: verifier_start..frag.len(),
        }))
    }
}

/// Fixed bytes between the header and the stub of a protected PDU.
pub fn body_prefix_len(header: &PduHeader) -> usize {
    match header.ptype {
        PacketType::Request if header.flags.contains(PacketFlags::OBJECT_UUID) => {
            REQUEST_PREFIX_SIZE + 16
        }
        PacketType::Request => REQUEST_PREFIX_SIZE,
        PacketType::Response => RESPONSE_PREFIX_SIZE,
        PacketType::Fault => FAULT_BODY_SIZE,
        _ => 0,
    }
}

/// Element count for a one-byte count field.
fn count_u8(n: usize) -> std::result::Result<u8, EncodeError> {
    u8::try_from(n).map_err(|_| EncodeError::CountOverflow(n))
}

fn encode_body(body: &PduBody, buf: &mut BytesMut, little: bool) -> Result<()> {
    match body {
        PduBody::Request(req) => {
            put_u32(buf, req.alloc_hint, little);
            put_u16(buf, req.context_id, little);
            put_u16(buf, req.opnum, little);
            if let Some(object) = &req.object {
                buf.put_slice(&object.to_bytes(little));
            }
            buf.put_slice(&req.stub);
        }
        PduBody::Response(resp) => {
            put_u32(buf, resp.alloc_hint, little);
            put_u16(buf, resp.context_id, little);
            buf.put_u8(resp.cancel_count);
            buf.put_u8(0);
            buf.put_slice(&resp.stub);
        }
        PduBody::Fault(f) => {
            put_u32(buf, f.alloc_hint, little);
            put_u16(buf, f.context_id, little);
            buf.put_u8(f.cancel_count);
            buf.put_u8(f.flags);
            put_u32(buf, f.status, little);
            put_u32(buf, 0, little);
        }
        PduBody::Bind(b) | PduBody::AlterContext(b) => {
            put_u16(buf, b.max_xmit_frag, little);
            put_u16(buf, b.max_recv_frag, little);
            put_u32(buf, b.assoc_group_id, little);
            buf.put_u8(count_u8(b.contexts.len())?);
            buf.put_u8(0);
            put_u16(buf, 0, little);
            for ctx in &b.contexts {
                put_u16(buf, ctx.context_id, little);
                buf.put_u8(count_u8(ctx.transfer_syntaxes.len())?);
                buf.put_u8(0);
                put_syntax(buf, &ctx.abstract_syntax, little);
                for ts in &ctx.transfer_syntaxes {
                    put_syntax(buf, ts, little);
                }
            }
        }
        PduBody::BindAck(a) | PduBody::AlterContextResponse(a) => {
            put_u16(buf, a.max_xmit_frag, little);
            put_u16(buf, a.max_recv_frag, little);
            put_u32(buf, a.assoc_group_id, little);
            if a.secondary_address.is_empty() {
                put_u16(buf, 0, little);
            } else {
                let len = a.secondary_address.len() + 1;
                let len = u16::try_from(len).map_err(|_| EncodeError::CountOverflow(len))?;
                put_u16(buf, len, little);
                buf.put_slice(a.secondary_address.as_bytes());
                buf.put_u8(0);
            }
            let pad = (4 - buf.len() % 4) % 4;
            buf.put_bytes(0, pad);
            buf.put_u8(count_u8(a.results.len())?);
            buf.put_u8(0);
            put_u16(buf, 0, little);
            for result in &a.results {
                put_u16(buf, result.outcome.into(), little);
                put_u16(buf, result.reason.into(), little);
                put_syntax(buf, &result.transfer_syntax, little);
            }
        }
        PduBody::BindNak(n) => {
            put_u16(buf, n.reason.into(), little);
            buf.put_u8(count_u8(n.versions.len())?);
            for (major, minor) in &n.versions {
                buf.put_u8(*major);
                buf.put_u8(*minor);
            }
        }
        PduBody::Auth3 => buf.put_bytes(0, 4),
        PduBody::Shutdown | PduBody::CoCancel | PduBody::Orphaned => {}
    }
    Ok(())
}

fn decode_body(header: &PduHeader, r: &mut BodyReader<'_>) -> Result<PduBody> {
    Ok(match header.ptype {
        PacketType::Request => {
            let alloc_hint = r.u32()?;
            let context_id = r.u16()?;
            let opnum = r.u16()?;
            let object = if header.flags.contains(PacketFlags::OBJECT_UUID) {
                Some(r.uuid()?)
            } else {
                None
            };
            PduBody::Request(RequestPdu {
                alloc_hint,
                context_id,
                opnum,
                object,
                stub: Bytes::copy_from_slice(r.rest()),
            })
        }
        PacketType::Response => {
            let alloc_hint = r.u32()?;
            let context_id = r.u16()?;
            let cancel_count = r.u8()?;
            let _reserved = r.u8()?;
            PduBody::Response(ResponsePdu {
                alloc_hint,
                context_id,
                cancel_count,
                stub: Bytes::copy_from_slice(r.rest()),
            })
        }
        PacketType::Fault => {
            let alloc_hint = r.u32()?;
            let context_id = r.u16()?;
            let cancel_count = r.u8()?;
            let flags = r.u8()?;
            let status = r.u32()?;
            PduBody::Fault(FaultPdu {
                alloc_hint,
                context_id,
                cancel_count,
                flags,
                status,
            })
        }
        PacketType::Bind => PduBody::Bind(decode_bind(r)?),
        PacketType::AlterContext => PduBody::AlterContext(decode_bind(r)?),
        PacketType::BindAck => PduBody::BindAck(decode_bind_ack(r)?),
        PacketType::AlterContextResponse => PduBody::AlterContextResponse(decode_bind_ack(r)?),
        PacketType::BindNak => {
            let reason = BindNakReason::from(r.u16()?);
            // Some peers omit the version list entirely.
            let count = if r.is_empty() { 0 } else { r.u8()? };
            let mut versions = Vec::with_capacity(count as usize);
            for _ in 0..count {
                versions.push((r.u8()?, r.u8()?));
            }
            PduBody::BindNak(BindNakPdu { reason, versions })
        }
        PacketType::Auth3 => PduBody::Auth3,
        PacketType::Shutdown => PduBody::Shutdown,
        PacketType::CoCancel => PduBody::CoCancel,
        PacketType::Orphaned => PduBody::Orphaned,
    })
}

fn decode_bind(r: &mut BodyReader<'_>) -> Result<BindPdu> {
    let max_xmit_frag = r.u16()?;
    let max_recv_frag = r.u16()?;
    let assoc_group_id = r.u32()?;
    let count = r.u8()?;
    r.skip(3)?;
    let mut contexts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let context_id = r.u16()?;
        let n_transfer = r.u8()?;
        r.skip(1)?;
        let abstract_syntax = r.syntax()?;
        let mut transfer_syntaxes = Vec::with_capacity(n_transfer as usize);
        for _ in 0..n_transfer {
            transfer_syntaxes.push(r.syntax()?);
        }
        contexts.push(ContextElement {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        });
    }
    Ok(BindPdu {
        max_xmit_frag,
        max_recv_frag,
        assoc_group_id,
        contexts,
    })
}

fn decode_bind_ack(r: &mut BodyReader<'_>) -> Result<BindAckPdu> {
    let max_xmit_frag = r.u16()?;
    let max_recv_frag = r.u16()?;
    let assoc_group_id = r.u32()?;
    let addr_len = r.u16()? as usize;
    let raw = r.bytes(addr_len)?;
    let secondary_address = String::from_utf8_lossy(raw.strip_suffix(&[0]).unwrap_or(raw)).into_owned();
    r.align(4)?;
    let count = r.u8()?;
    r.skip(3)?;
    let mut results = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let outcome = ContextOutcome::from(r.u16()?);
        let reason = ProviderReason::from(r.u16()?);
        let transfer_syntax = r.syntax()?;
        results.push(ContextResult {
            outcome,
            reason,
            transfer_syntax,
        });
    }
    Ok(BindAckPdu {
        max_xmit_frag,
        max_recv_frag,
        assoc_group_id,
        secondary_address,
        results,
    })
}

/// Cursor over a PDU body; alignment is relative to the fragment start.
struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
    little: bool,
}

impl<'a> BodyReader<'a> {
    /// `frag` is the fragment up to the end of the body; reading starts at `start`.
    fn new(frag: &'a [u8], start: usize, little: bool) -> Self {
        Self {
            buf: &frag[start..],
            pos: 0,
            base: start,
            little,
        }
    }

    fn truncated() -> ProtocolError {
        ProtocolError::FramingError("PDU body truncated".into())
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(Self::truncated)?;
        let buf = self.buf;
        let out = buf.get(self.pos..end).ok_or_else(Self::truncated)?;
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn align(&mut self, n: usize) -> Result<()> {
        let pad = (n - (self.base + self.pos) % n) % n;
        self.skip(pad)
    }

    fn rest(&mut self) -> &'a [u8] {
        let buf = self.buf;
        let out = &buf[self.pos.min(buf.len())..];
        self.pos = buf.len();
        out
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(read_u16(self.bytes(2)?, self.little))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(read_u32(self.bytes(4)?, self.little))
    }

    fn uuid(&mut self) -> Result<Uuid> {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(self.bytes(16)?);
        Ok(Uuid::from_bytes(&raw, self.little))
    }

    fn syntax(&mut self) -> Result<SyntaxId> {
        let uuid = self.uuid()?;
        let version = self.u32()?;
        Ok(SyntaxId { uuid, version })
    }
}

#[inline]
fn read_u16(b: &[u8], little: bool) -> u16 {
    let raw = [b[0], b[1]];
    if little {
        u16::from_le_bytes(raw)
    } else {
        u16::from_be_bytes(raw)
    }
}

#[inline]
fn read_u32(b: &[u8], little: bool) -> u32 {
    let raw = [b[0], b[1], b[2], b[3]];
    if little {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    }
}

#[inline]
fn put_u16(buf: &mut BytesMut, v: u16, little: bool) {
    if little {
        buf.put_u16_le(v)
    } else {
        buf.put_u16(v)
    }
}

#[inline]
fn put_u32(buf: &mut BytesMut, v: u32, little: bool) {
    if little {
        buf.put_u32_le(v)
    } else {
        buf.put_u32(v)
    }
}

fn put_syntax(buf: &mut BytesMut, id: &SyntaxId, little: bool) {
    buf.put_slice(&id.uuid.to_bytes(little));
    put_u32(buf, id.version, little);
}
