//! # Security
//!
//! Pluggable authentication for connection-oriented RPC.
//!
//! A [`Mechanism`] is one concrete authentication exchange plus the per-PDU
//! signing and sealing it enables. [`SecurityContext`] wraps a mechanism for a
//! single connection: it owns the sequence counters, lays verifiers out in the
//! PDU authentication trailer and refuses out-of-order traffic.
//!
//! ## Components
//! - **Context**: Per-connection adapter with sequence checks and PDU protection
//! - **ECDH**: x25519 key agreement with timestamped nonces and ChaCha20-Poly1305
//! - **Negotiate**: Meta-mechanism that settles on the first mechanism both peers accept
//!
//! Mechanisms are handed to a connection or server through its options; there
//! is no process-wide registry.

pub mod context;
pub mod ecdh;
pub mod negotiate;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

pub use context::SecurityContext;
pub use ecdh::EcdhProvider;
pub use negotiate::NegotiateProvider;

/// Authentication type identifiers carried in the trailer.
pub mod auth_type {
    pub const NONE: u8 = 0;
    pub const NEGOTIATE: u8 = 9;
    /// Private-range identifier for the x25519 mechanism.
    pub const ECDH: u8 = 0x90;
}

/// Protection applied to a connection.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AuthLevel {
    #[default]
    None = 1,
    /// Authenticate at bind time only.
    Connect = 2,
    Call = 3,
    Packet = 4,
    /// Sign every request, response and fault.
    Integrity = 5,
    /// Seal every request, response and fault.
    Privacy = 6,
}

impl AuthLevel {
    /// Whether request, response and fault PDUs carry a verifier.
    pub fn protects_pdus(self) -> bool {
        self >= AuthLevel::Call
    }

    pub fn seals(self) -> bool {
        self == AuthLevel::Privacy
    }
}

impl TryFrom<u8> for AuthLevel {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            // Level 0 is the "default" level, which every stack maps to connect.
            0 | 2 => AuthLevel::Connect,
            1 => AuthLevel::None,
            3 => AuthLevel::Call,
            4 => AuthLevel::Packet,
            5 => AuthLevel::Integrity,
            6 => AuthLevel::Privacy,
            other => {
                return Err(ProtocolError::AuthError(format!(
                    "unknown authentication level {other}"
                )))
            }
        })
    }
}

/// Outcome of one step of a token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Continue,
    Established,
    Failed(String),
}

/// Token to send (if any) and where the exchange stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub token: Option<Vec<u8>>,
    pub status: StepStatus,
}

impl Step {
    pub fn proceed(token: Vec<u8>) -> Self {
        Self {
            token: Some(token),
            status: StepStatus::Continue,
        }
    }

    pub fn established(token: Option<Vec<u8>>) -> Self {
        Self {
            token,
            status: StepStatus::Established,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            token: None,
            status: StepStatus::Failed(reason.into()),
        }
    }
}

/// Identity information a mechanism may bind its exchange to.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Transport-level identity of the peer (e.g. its socket address).
    pub peer_identity: &'a str,
    /// Service principal the initiator expects to reach.
    pub target_name: &'a str,
}

/// Which end of the exchange a mechanism plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// One concrete authentication mechanism bound to one connection.
///
/// Sequence numbers are supplied by [`SecurityContext`]; a mechanism must mix
/// them into every signature and seal so that reordered traffic fails.
pub trait Mechanism: Send + Sync {
    fn name(&self) -> &'static str;

    fn auth_type(&self) -> u8;

    /// Advance the token exchange. The first initiator step takes no input.
    fn step(&mut self, ctx: &StepContext<'_>, input: Option<&[u8]>) -> Step;

    fn is_established(&self) -> bool;

    /// Length of a signature or seal tag.
    fn signature_len(&self) -> usize;

    fn sign(&mut self, seq: u32, message: &[u8]) -> Result<Vec<u8>>;

    fn verify(&mut self, seq: u32, message: &[u8], signature: &[u8]) -> bool;

    /// Encrypt `data` in place, authenticating `aad`; returns the tag.
    fn seal(&mut self, seq: u32, aad: &[u8], data: &mut [u8]) -> Result<Vec<u8>>;

    fn unseal(&mut self, seq: u32, aad: &[u8], data: &mut [u8], tag: &[u8]) -> Result<()>;
}

/// Factory for mechanisms of one authentication type.
pub trait MechanismProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn auth_type(&self) -> u8;

    fn create(&self, role: Role) -> Box<dyn Mechanism>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(!AuthLevel::Connect.protects_pdus());
        assert!(AuthLevel::Integrity.protects_pdus());
        assert!(AuthLevel::Privacy.seals());
        assert!(!AuthLevel::Integrity.seals());
    }

    #[test]
    fn test_level_from_wire() {
        assert_eq!(AuthLevel::try_from(6).ok(), Some(AuthLevel::Privacy));
        assert_eq!(AuthLevel::try_from(0).ok(), Some(AuthLevel::Connect));
        assert!(AuthLevel::try_from(7).is_err());
    }
}
