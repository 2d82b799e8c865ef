//! # Fragment Codec
//!
//! Tokio codec that cuts a byte stream into whole PDU fragments.
//!
//! The decoder only validates what it needs for framing: the version pair and
//! `frag_length`. Frames are handed up as raw bytes because the security layer
//! verifies and unseals them in place before the body is parsed.
//!
//! ## Security
//! - Fragments larger than the negotiated receive size are rejected before the
//!   body is buffered
//! - `frag_length` below the header size is a protocol violation

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::pdu::{PduHeader, DEFAULT_MAX_FRAG, HEADER_SIZE};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy)]
pub struct PduCodec {
    max_frag: usize,
}

impl PduCodec {
    pub fn new(max_frag: u16) -> Self {
        Self {
            max_frag: max_frag as usize,
        }
    }

    pub fn max_frag(&self) -> usize {
        self.max_frag
    }

    /// Raise or lower the receive limit once negotiation settles it.
    pub fn set_max_frag(&mut self, max_frag: u16) {
        self.max_frag = max_frag as usize;
    }
}

impl Default for PduCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAG)
    }
}

impl Decoder for PduCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = PduHeader::parse(&src[..HEADER_SIZE])?;
        let frag_length = header.frag_length as usize;
        if frag_length > self.max_frag {
            return Err(ProtocolError::OversizedFragment(frag_length));
        }

        if src.len() < frag_length {
            src.reserve(frag_length - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(frag_length)))
    }
}

impl Encoder<Bytes> for PduCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        dst.reserve(item.len());
        dst.extend_from_slice(item.chunk());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::pdu::{Pdu, PduBody};
    use crate::core::syntax::DataRepresentation;

    fn shutdown_frag() -> BytesMut {
        Pdu::new(3, DataRepresentation::LITTLE_ENDIAN, PduBody::Shutdown)
            .encode()
            .unwrap()
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = PduCodec::default();
        let frag = shutdown_frag();
        let mut buf = BytesMut::from(&frag[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut codec = PduCodec::default();
        let frag = shutdown_frag();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frag);
        buf.extend_from_slice(&frag);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frag);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frag);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_fragment_rejected() {
        let mut codec = PduCodec::new(20);
        let mut frag = shutdown_frag();
        frag[8] = 0x00;
        frag[9] = 0x01;
        assert!(matches!(
            codec.decode(&mut frag),
            Err(ProtocolError::OversizedFragment(256))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut codec = PduCodec::default();
        let mut frag = shutdown_frag();
        frag[1] = 1;
        assert!(matches!(
            codec.decode(&mut frag),
            Err(ProtocolError::UnsupportedVersion(5, 1))
        ));
    }
}
