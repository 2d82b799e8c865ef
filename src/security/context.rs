//! Per-connection security context.
//!
//! Wraps a [`Mechanism`] with the state the wire protocol needs around it:
//! the negotiated level, the trailer's context id and one sequence counter per
//! direction. The verifier placed in the trailer is the 4-byte little-endian
//! sequence number followed by the mechanism's signature or seal tag.
//!
//! Sequence numbers are checked before any cryptographic work. A verifier
//! carrying anything other than the next expected number is rejected with
//! [`ProtocolError::AuthSequenceError`] and the counter does not move.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::core::pdu::{AuthLayout, AuthTrailer, PacketType, PduHeader, AUTH_TRAILER_SIZE};
use crate::error::{constants, ProtocolError, Result};
use crate::security::{AuthLevel, Mechanism, Step, StepContext, StepStatus};
use crate::utils::metrics::global_metrics;

const SEQ_LEN: usize = 4;

pub struct SecurityContext {
    mechanism: Box<dyn Mechanism>,
    level: AuthLevel,
    context_id: u32,
    peer_identity: String,
    target_name: String,
    send_seq: u32,
    recv_seq: u32,
    established: bool,
}

impl SecurityContext {
    pub fn new(
        mechanism: Box<dyn Mechanism>,
        level: AuthLevel,
        context_id: u32,
        peer_identity: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            mechanism,
            level,
            context_id,
            peer_identity: peer_identity.into(),
            target_name: target_name.into(),
            send_seq: 0,
            recv_seq: 0,
            established: false,
        }
    }

    /// Drive the token exchange one step.
    ///
    /// `input` is the peer's last token; the initiator's first call passes
    /// `None`. A failed step is returned as an error.
    pub fn initialize(&mut self, input: Option<&[u8]>) -> Result<Step> {
        let ctx = StepContext {
            peer_identity: &self.peer_identity,
            target_name: &self.target_name,
        };
        let step = self.mechanism.step(&ctx, input);
        match &step.status {
            StepStatus::Failed(reason) => {
                global_metrics().auth_failure();
                Err(ProtocolError::AuthError(reason.clone()))
            }
            StepStatus::Established => {
                self.established = true;
                debug!(
                    mechanism = self.mechanism.name(),
                    level = ?self.level,
                    "Security context established"
                );
                Ok(step)
            }
            StepStatus::Continue => Ok(step),
        }
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }

    pub fn auth_type(&self) -> u8 {
        self.mechanism.auth_type()
    }

    pub fn mechanism_name(&self) -> &'static str {
        self.mechanism.name()
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    /// Bytes of verifier carried by a protected PDU.
    pub fn verifier_len(&self) -> usize {
        SEQ_LEN + self.mechanism.signature_len()
    }

    /// Trailer carrying a handshake token.
    pub fn token_trailer(&self, token: Vec<u8>) -> AuthTrailer {
        AuthTrailer {
            auth_type: self.auth_type(),
            auth_level: self.level as u8,
            pad_length: 0,
            context_id: self.context_id,
            verifier: Bytes::from(token),
        }
    }

    /// Zero-filled trailer reserving room for [`SecurityContext::protect`].
    pub fn placeholder_trailer(&self) -> Option<AuthTrailer> {
        if !self.level.protects_pdus() {
            return None;
        }
        Some(AuthTrailer {
            auth_type: self.auth_type(),
            auth_level: self.level as u8,
            pad_length: 0,
            context_id: self.context_id,
            verifier: Bytes::from(vec![0u8; self.verifier_len()]),
        })
    }

    fn next_send_seq(&mut self) -> Result<u32> {
        let seq = self.send_seq;
        self.send_seq = seq
            .checked_add(1)
            .ok_or_else(|| ProtocolError::AuthError("send sequence exhausted".into()))?;
        Ok(seq)
    }

    fn check_recv_seq(&mut self, received: u32) -> Result<()> {
        if received != self.recv_seq {
            global_metrics().sequence_violation();
            warn!(expected = self.recv_seq, received, "Out-of-sequence verifier");
            return Err(ProtocolError::AuthSequenceError {
                expected: self.recv_seq,
                received,
            });
        }
        Ok(())
    }

    fn advance_recv_seq(&mut self) -> Result<()> {
        self.recv_seq = self
            .recv_seq
            .checked_add(1)
            .ok_or_else(|| ProtocolError::AuthError("receive sequence exhausted".into()))?;
        Ok(())
    }

    fn require_established(&self) -> Result<()> {
        if !self.established {
            return Err(ProtocolError::AuthError(constants::ERR_NOT_ESTABLISHED.into()));
        }
        Ok(())
    }

    /// Sign `message` at the next send sequence number.
    pub fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.require_established()?;
        let seq = self.next_send_seq()?;
        let signature = self.mechanism.sign(seq, message)?;
        let mut verifier = Vec::with_capacity(SEQ_LEN + signature.len());
        verifier.extend_from_slice(&seq.to_le_bytes());
        verifier.extend_from_slice(&signature);
        Ok(verifier)
    }

    /// Check a verifier produced by the peer's [`SecurityContext::sign`].
    ///
    /// Returns `Ok(false)` for a bad signature and an error for a sequence
    /// number other than the next expected one.
    pub fn verify(&mut self, message: &[u8], verifier: &[u8]) -> Result<bool> {
        self.require_established()?;
        let seq = verifier_seq(verifier)?;
        self.check_recv_seq(seq)?;
        if !self.mechanism.verify(seq, message, &verifier[SEQ_LEN..]) {
            return Ok(false);
        }
        self.advance_recv_seq()?;
        Ok(true)
    }

    /// Encrypt `data` in place; returns the verifier.
    pub fn seal(&mut self, aad: &[u8], data: &mut [u8]) -> Result<Vec<u8>> {
        self.require_established()?;
        let seq = self.next_send_seq()?;
        let tag = self.mechanism.seal(seq, aad, data)?;
        let mut verifier = Vec::with_capacity(SEQ_LEN + tag.len());
        verifier.extend_from_slice(&seq.to_le_bytes());
        verifier.extend_from_slice(&tag);
        Ok(verifier)
    }

    pub fn unseal(&mut self, aad: &[u8], data: &mut [u8], verifier: &[u8]) -> Result<()> {
        self.require_established()?;
        let seq = verifier_seq(verifier)?;
        self.check_recv_seq(seq)?;
        self.mechanism
            .unseal(seq, aad, data, &verifier[SEQ_LEN..])?;
        self.advance_recv_seq()
    }

    /// Sign or seal an encoded fragment in place.
    ///
    /// The fragment must have been encoded with
    /// [`SecurityContext::placeholder_trailer`]. Fragments without a trailer
    /// and PDU types that never carry a verifier are left untouched.
    pub fn protect(&mut self, frag: &mut BytesMut) -> Result<()> {
        let header = PduHeader::parse_fragment(frag)?;
        if !carries_verifier(header.ptype) {
            return Ok(());
        }
        let Some(layout) = AuthLayout::locate(frag)? else {
            return Ok(());
        };
        if layout.verifier.len() != self.verifier_len() {
            return Err(ProtocolError::FramingError(constants::ERR_AUTH_LENGTH.into()));
        }

        let verifier = if self.level.seals() {
            let aad = additional_data(frag, &layout);
            self.seal(&aad, &mut frag[layout.payload.clone()])?
        } else {
            let message = frag[..layout.verifier.start].to_vec();
            self.sign(&message)?
        };
        frag[layout.verifier.clone()].copy_from_slice(&verifier);
        Ok(())
    }

    /// Verify or unseal a received fragment in place.
    pub fn unprotect(&mut self, frag: &mut BytesMut) -> Result<()> {
        let header = PduHeader::parse_fragment(frag)?;
        if !carries_verifier(header.ptype) {
            return Ok(());
        }
        let Some(layout) = AuthLayout::locate(frag)? else {
            if self.level.protects_pdus() {
                global_metrics().auth_failure();
                return Err(ProtocolError::AuthError(constants::ERR_VERIFY_FAILED.into()));
            }
            return Ok(());
        };

        let trailer = &frag[layout.trailer..layout.trailer + AUTH_TRAILER_SIZE];
        if trailer[0] != self.auth_type() || trailer[1] != self.level as u8 {
            global_metrics().auth_failure();
            return Err(ProtocolError::AuthError(
                constants::ERR_AUTH_LEVEL_MISMATCH.into(),
            ));
        }
        if layout.verifier.len() != self.verifier_len() {
            return Err(ProtocolError::FramingError(constants::ERR_AUTH_LENGTH.into()));
        }

        let verifier = frag[layout.verifier.clone()].to_vec();
        if self.level.seals() {
            let aad = additional_data(frag, &layout);
            self.unseal(&aad, &mut frag[layout.payload.clone()], &verifier)
                .inspect_err(|_| global_metrics().auth_failure())?;
        } else {
            let message = frag[..layout.verifier.start].to_vec();
            if !self.verify(&message, &verifier)? {
                global_metrics().auth_failure();
                return Err(ProtocolError::AuthError(constants::ERR_VERIFY_FAILED.into()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("mechanism", &self.mechanism.name())
            .field("level", &self.level)
            .field("context_id", &self.context_id)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("established", &self.established)
            .finish()
    }
}

fn carries_verifier(ptype: PacketType) -> bool {
    matches!(
        ptype,
        PacketType::Request | PacketType::Response | PacketType::Fault
    )
}

fn verifier_seq(verifier: &[u8]) -> Result<u32> {
    let raw: [u8; SEQ_LEN] = verifier
        .get(..SEQ_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProtocolError::AuthError(constants::ERR_VERIFY_FAILED.into()))?;
    Ok(u32::from_le_bytes(raw))
}

/// Header, body prefix and trailer header: everything sealing leaves in the clear.
fn additional_data(frag: &[u8], layout: &AuthLayout) -> Vec<u8> {
    let mut aad = Vec::with_capacity(layout.payload.start + AUTH_TRAILER_SIZE);
    aad.extend_from_slice(&frag[..layout.payload.start]);
    aad.extend_from_slice(&frag[layout.trailer..layout.verifier.start]);
    aad
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::pdu::{Pdu, PduBody, RequestPdu};
    use crate::core::syntax::DataRepresentation;
    use crate::security::ecdh::EcdhProvider;
    use crate::security::{MechanismProvider, Role};

    fn pair(level: AuthLevel) -> (SecurityContext, SecurityContext) {
        let provider = EcdhProvider::new();
        let mut client =
            SecurityContext::new(provider.create(Role::Initiator), level, 0, "server", "host/a");
        let mut server =
            SecurityContext::new(provider.create(Role::Acceptor), level, 0, "client", "");
        let t1 = client.initialize(None).unwrap().token;
        let t2 = server.initialize(t1.as_deref()).unwrap().token;
        let t3 = client.initialize(t2.as_deref()).unwrap().token;
        server.initialize(t3.as_deref()).unwrap();
        assert!(client.is_established() && server.is_established());
        (client, server)
    }

    fn request_frag(ctx: &SecurityContext, stub: &[u8]) -> BytesMut {
        let mut pdu = Pdu::new(
            1,
            DataRepresentation::LITTLE_ENDIAN,
            PduBody::Request(RequestPdu {
                alloc_hint: stub.len() as u32,
                context_id: 0,
                opnum: 1,
                object: None,
                stub: Bytes::copy_from_slice(stub),
            }),
        );
        pdu.auth = ctx.placeholder_trailer();
        pdu.encode().unwrap()
    }

    #[test]
    fn test_seal_roundtrip_hides_stub() {
        let (mut client, mut server) = pair(AuthLevel::Privacy);
        let mut frag = request_frag(&client, b"secret stub");
        client.protect(&mut frag).unwrap();
        assert!(!frag.windows(11).any(|w| w == b"secret stub"));

        server.unprotect(&mut frag).unwrap();
        match Pdu::decode(&frag).unwrap().body {
            PduBody::Request(req) => assert_eq!(&req.stub[..], b"secret stub"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_sign_detects_tampering() {
        let (mut client, mut server) = pair(AuthLevel::Integrity);
        let mut frag = request_frag(&client, b"payload");
        client.protect(&mut frag).unwrap();
        frag[24] ^= 0x01;
        assert!(matches!(
            server.unprotect(&mut frag),
            Err(ProtocolError::AuthError(_))
        ));
    }

    #[test]
    fn test_replayed_fragment_is_sequence_error() {
        let (mut client, mut server) = pair(AuthLevel::Integrity);
        let mut first = request_frag(&client, b"one");
        client.protect(&mut first).unwrap();
        let replay = first.clone();
        server.unprotect(&mut first).unwrap();

        let mut replay = replay;
        assert!(matches!(
            server.unprotect(&mut replay),
            Err(ProtocolError::AuthSequenceError {
                expected: 1,
                received: 0
            })
        ));
    }

    #[test]
    fn test_skipped_sequence_rejected() {
        let (mut client, mut server) = pair(AuthLevel::Privacy);
        let mut a = request_frag(&client, b"a");
        let mut b = request_frag(&client, b"b");
        client.protect(&mut a).unwrap();
        client.protect(&mut b).unwrap();
        assert!(matches!(
            server.unprotect(&mut b),
            Err(ProtocolError::AuthSequenceError {
                expected: 0,
                received: 1
            })
        ));
        // The counter did not move: the in-order fragment still verifies.
        server.unprotect(&mut a).unwrap();
    }

    #[test]
    fn test_connect_level_leaves_pdus_alone() {
        let (mut client, mut server) = pair(AuthLevel::Connect);
        assert!(client.placeholder_trailer().is_none());
        let mut frag = request_frag(&client, b"plain");
        let before = frag.clone();
        client.protect(&mut frag).unwrap();
        assert_eq!(frag, before);
        server.unprotect(&mut frag).unwrap();
    }

    #[test]
    fn test_missing_verifier_rejected_at_integrity() {
        let (_client, mut server) = pair(AuthLevel::Integrity);
        let plain = SecurityContext::new(
            EcdhProvider::new().create(Role::Initiator),
            AuthLevel::Connect,
            0,
            "",
            "",
        );
        let mut frag = request_frag(&plain, b"unsigned");
        assert!(matches!(
            server.unprotect(&mut frag),
            Err(ProtocolError::AuthError(_))
        ));
    }

    #[test]
    fn test_sign_requires_established() {
        let mut ctx = SecurityContext::new(
            EcdhProvider::new().create(Role::Initiator),
            AuthLevel::Integrity,
            0,
            "",
            "",
        );
        assert!(ctx.sign(b"x").is_err());
    }
}
