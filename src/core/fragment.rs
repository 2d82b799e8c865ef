//! # Fragmentation
//!
//! Splitting of request and response stubs across fragments, and per-call
//! reassembly on the receive side.
//!
//! A call's fragments are always written back to back under the connection's
//! writer lock, so the receiver can rely on arrival order. Reassembly keys on
//! the call id; the context id must stay the same for every fragment of a call.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

use crate::core::pdu::{
    PacketFlags, Pdu, PduBody, AUTH_TRAILER_SIZE, HEADER_SIZE, MUST_RECV_FRAG_SIZE,
};
use crate::error::{constants, ProtocolError, Result};

/// Default ceiling for one reassembled call body.
pub const DEFAULT_MAX_CALL_SIZE: usize = 16 * 1024 * 1024;

/// Stub bytes that fit in one fragment.
///
/// With a verifier the capacity is rounded down to a multiple of four so that
/// only the last fragment needs auth padding.
pub fn stub_capacity(max_frag: u16, prefix: usize, verifier_len: Option<usize>) -> usize {
    let max_frag = max_frag.max(MUST_RECV_FRAG_SIZE) as usize;
    let overhead = HEADER_SIZE + prefix;
    match verifier_len {
        Some(len) => {
            let room = max_frag.saturating_sub(overhead + AUTH_TRAILER_SIZE + len);
            (room & !3).max(4)
        }
        None => max_frag.saturating_sub(overhead).max(1),
    }
}

/// Split `body` into chunks of at most `chunk` bytes.
///
/// An empty body still yields one empty chunk: every call carries at least
/// one fragment.
pub fn split_body(body: &Bytes, chunk: usize) -> Vec<Bytes> {
    let chunk = chunk.max(1);
    if body.is_empty() {
        return vec![Bytes::new()];
    }
    let mut out = Vec::with_capacity(body.len().div_ceil(chunk));
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk).min(body.len());
        out.push(body.slice(offset..end));
        offset = end;
    }
    out
}

/// First/last flags for fragment `index` of `total`.
pub fn fragment_flags(index: usize, total: usize) -> PacketFlags {
    let mut flags = PacketFlags::empty();
    if index == 0 {
        flags |= PacketFlags::FIRST_FRAG;
    }
    if index + 1 == total {
        flags |= PacketFlags::LAST_FRAG;
    }
    flags
}

struct Partial {
    first: Pdu,
    context_id: u16,
    body: BytesMut,
}

/// Per-call reassembly buffers.
pub struct Reassembler {
    calls: HashMap<u32, Partial>,
    max_call_size: usize,
}

impl Reassembler {
    pub fn new(max_call_size: usize) -> Self {
        Self {
            calls: HashMap::new(),
            max_call_size,
        }
    }

    /// Feed one request or response fragment.
    ///
    /// Returns the complete call, shaped as a single-fragment PDU carrying the
    /// whole stub, once the last fragment arrives. Any framing error discards
    /// the partial state of that call.
    pub fn push(&mut self, pdu: Pdu) -> Result<Option<Pdu>> {
        let call_id = pdu.call_id;
        let (context_id, stub) = match &pdu.body {
            PduBody::Request(req) => (req.context_id, req.stub.clone()),
            PduBody::Response(resp) => (resp.context_id, resp.stub.clone()),
            _ => return Err(ProtocolError::UnexpectedMessage),
        };
        let first = pdu.flags.contains(PacketFlags::FIRST_FRAG);
        let last = pdu.flags.contains(PacketFlags::LAST_FRAG);

        if first {
            if self.calls.remove(&call_id).is_some() {
                return Err(ProtocolError::FramingError(
                    constants::ERR_UNEXPECTED_FIRST_FRAG.into(),
                ));
            }
            if last {
                return Ok(Some(pdu));
            }
            self.check_size(call_id, stub.len())?;
            let mut body = BytesMut::with_capacity(stub.len() * 2);
            body.extend_from_slice(&stub);
            self.calls.insert(
                call_id,
                Partial {
                    first: pdu,
                    context_id,
                    body,
                },
            );
            return Ok(None);
        }

        let Some(partial) = self.calls.get_mut(&call_id) else {
            return Err(ProtocolError::FramingError(
                constants::ERR_MISSING_FIRST_FRAG.into(),
            ));
        };
        if partial.context_id != context_id {
            self.calls.remove(&call_id);
            return Err(ProtocolError::FramingError(
                constants::ERR_CONTEXT_ID_MISMATCH.into(),
            ));
        }
        let total = partial.body.len() + stub.len();
        if total > self.max_call_size {
            self.calls.remove(&call_id);
            return Err(ProtocolError::FramingError(format!(
                "call {call_id} exceeds {} bytes",
                self.max_call_size
            )));
        }
        partial.body.extend_from_slice(&stub);

        if !last {
            return Ok(None);
        }
        let Some(partial) = self.calls.remove(&call_id) else {
            return Ok(None);
        };
        let mut whole = partial.first;
        let body = partial.body.freeze();
        match &mut whole.body {
            PduBody::Request(req) => req.stub = body,
            PduBody::Response(resp) => resp.stub = body,
            _ => {}
        }
        whole.flags |= PacketFlags::LAST_FRAG;
        Ok(Some(whole))
    }

    fn check_size(&mut self, call_id: u32, len: usize) -> Result<()> {
        if len > self.max_call_size {
            self.calls.remove(&call_id);
            return Err(ProtocolError::FramingError(format!(
                "call {call_id} exceeds {} bytes",
                self.max_call_size
            )));
        }
        Ok(())
    }

    /// Drop whatever has been collected for `call_id`.
    pub fn discard(&mut self, call_id: u32) -> bool {
        self.calls.remove(&call_id).is_some()
    }

    pub fn in_progress(&self) -> usize {
        self.calls.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALL_SIZE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::pdu::{RequestPdu, REQUEST_PREFIX_SIZE};
    use crate::core::syntax::DataRepresentation;

    fn fragment(call_id: u32, context_id: u16, flags: PacketFlags, stub: &[u8]) -> Pdu {
        Pdu::new(
            call_id,
            DataRepresentation::LITTLE_ENDIAN,
            PduBody::Request(RequestPdu {
                alloc_hint: 0,
                context_id,
                opnum: 2,
                object: None,
                stub: Bytes::copy_from_slice(stub),
            }),
        )
        .with_flags(flags)
    }

    #[test]
    fn test_split_sizes() {
        let body = Bytes::from(vec![7u8; 10]);
        let parts = split_body(&body, 4);
        let sizes: Vec<usize> = parts.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let parts = split_body(&Bytes::from(vec![0u8; 8]), 4);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.len() == 4));

        assert_eq!(split_body(&Bytes::new(), 4), vec![Bytes::new()]);
    }

    #[test]
    fn test_fragment_flags() {
        assert_eq!(fragment_flags(0, 1), PacketFlags::single());
        assert_eq!(fragment_flags(0, 3), PacketFlags::FIRST_FRAG);
        assert_eq!(fragment_flags(1, 3), PacketFlags::empty());
        assert_eq!(fragment_flags(2, 3), PacketFlags::LAST_FRAG);
    }

    #[test]
    fn test_stub_capacity_with_verifier() {
        let plain = stub_capacity(4280, REQUEST_PREFIX_SIZE, None);
        assert_eq!(plain, 4280 - 24);
        let sealed = stub_capacity(4280, REQUEST_PREFIX_SIZE, Some(20));
        assert_eq!(sealed % 4, 0);
        assert!(sealed <= 4280 - 24 - 8 - 20);
        // Sizes under the mandatory minimum are raised to it.
        assert_eq!(stub_capacity(100, REQUEST_PREFIX_SIZE, None), 1432 - 24);
    }

    #[test]
    fn test_reassembly_in_order() {
        let mut r = Reassembler::default();
        assert!(r
            .push(fragment(1, 0, PacketFlags::FIRST_FRAG, &[1, 2]))
            .unwrap()
            .is_none());
        assert!(r
            .push(fragment(1, 0, PacketFlags::empty(), &[3]))
            .unwrap()
            .is_none());
        let whole = r
            .push(fragment(1, 0, PacketFlags::LAST_FRAG, &[4]))
            .unwrap()
            .unwrap();
        match whole.body {
            PduBody::Request(req) => assert_eq!(&req.stub[..], &[1, 2, 3, 4]),
            other => panic!("unexpected body {other:?}"),
        }
        assert_eq!(r.in_progress(), 0);
    }

    #[test]
    fn test_interleaved_calls() {
        let mut r = Reassembler::default();
        r.push(fragment(1, 0, PacketFlags::FIRST_FRAG, &[1])).unwrap();
        r.push(fragment(2, 1, PacketFlags::FIRST_FRAG, &[9])).unwrap();
        let two = r
            .push(fragment(2, 1, PacketFlags::LAST_FRAG, &[8]))
            .unwrap()
            .unwrap();
        assert_eq!(two.call_id, 2);
        assert_eq!(r.in_progress(), 1);
    }

    #[test]
    fn test_framing_errors() {
        let mut r = Reassembler::default();
        assert!(matches!(
            r.push(fragment(5, 0, PacketFlags::LAST_FRAG, &[1])),
            Err(ProtocolError::FramingError(_))
        ));

        r.push(fragment(6, 0, PacketFlags::FIRST_FRAG, &[1])).unwrap();
        assert!(matches!(
            r.push(fragment(6, 3, PacketFlags::LAST_FRAG, &[1])),
            Err(ProtocolError::FramingError(_))
        ));
        assert_eq!(r.in_progress(), 0);

        r.push(fragment(7, 0, PacketFlags::FIRST_FRAG, &[1])).unwrap();
        assert!(matches!(
            r.push(fragment(7, 0, PacketFlags::FIRST_FRAG, &[1])),
            Err(ProtocolError::FramingError(_))
        ));
    }

    #[test]
    fn test_call_size_limit() {
        let mut r = Reassembler::new(3);
        r.push(fragment(1, 0, PacketFlags::FIRST_FRAG, &[1, 2])).unwrap();
        assert!(r
            .push(fragment(1, 0, PacketFlags::empty(), &[3, 4]))
            .is_err());
        assert_eq!(r.in_progress(), 0);
    }
}
