//! # Error Types
//!
//! Comprehensive error handling for the RPC engine.
//!
//! This module defines all error variants that can occur during protocol operations,
//! from malformed wire bytes to dead connections.
//!
//! ## Error Categories
//! - **Transport Errors**: connect/read/write failures, never retried by the engine
//! - **Negotiation Errors**: no mutually acceptable presentation context
//! - **Codec Errors**: malformed NDR input ([`DecodeError`]) or unencodable values ([`EncodeError`])
//! - **Framing Errors**: fragments that cannot be reassembled
//! - **Security Errors**: rejected mechanisms, failed verification, sequence violations
//! - **Call Outcomes**: server faults, local timeouts, unimplemented operations
//!
//! Callers can ask [`ProtocolError::is_connection_fatal`] whether only their call
//! failed or whether the connection is gone and must be reopened.
//!
//! ## Example Usage
//! ```rust
//! use dcerpc_engine::error::{ProtocolError, Result};
//! use tracing::{error, warn};
//!
//! fn report(result: Result<Vec<u8>>) {
//!     match result {
//!         Ok(_) => {}
//!         Err(ProtocolError::Fault { status }) => warn!(status, "server reported a fault"),
//!         Err(e) if e.is_connection_fatal() => error!(error = %e, "connection lost"),
//!         Err(e) => warn!(error = %e, "call failed"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatch table";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatch table";

    /// Framing errors
    pub const ERR_INVALID_HEADER: &str = "Invalid PDU header";
    pub const ERR_FRAG_LENGTH: &str = "Fragment length does not match header";
    pub const ERR_AUTH_LENGTH: &str = "Authentication length exceeds fragment";
    pub const ERR_UNEXPECTED_FIRST_FRAG: &str = "First fragment received for a call already in progress";
    pub const ERR_MISSING_FIRST_FRAG: &str = "Continuation fragment received without a first fragment";
    pub const ERR_CONTEXT_ID_MISMATCH: &str = "Fragment presentation context differs from first fragment";
    pub const ERR_RESPONSE_CONTEXT_MISMATCH: &str = "Response carries a different presentation context than its request";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TIMEOUT: &str = "Operation timed out";
    pub const ERR_NOT_ACTIVE: &str = "Connection is not active";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Negotiation errors
    pub const ERR_NO_CONTEXT_ACCEPTED: &str = "Server accepted no presentation context";
    pub const ERR_UNKNOWN_CONTEXT: &str = "Presentation context was never negotiated";
    pub const ERR_UNEXPECTED_PDU: &str = "Unexpected PDU type";

    /// Security errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_INVALID_TIMESTAMP: &str = "Invalid or stale timestamp";
    pub const ERR_REPLAY_ATTACK: &str = "Replay attack detected - nonce/timestamp already seen";
    pub const ERR_NONCE_VERIFICATION_FAILED: &str = "Peer failed to verify our nonce";
    pub const ERR_MALFORMED_TOKEN: &str = "Malformed security token";
    pub const ERR_NOT_ESTABLISHED: &str = "Security context is not established";
    pub const ERR_VERIFY_FAILED: &str = "PDU verifier check failed";
    pub const ERR_UNSEAL_FAILED: &str = "PDU could not be unsealed";
    pub const ERR_SEAL_FAILED: &str = "PDU could not be sealed";
    pub const ERR_NO_COMMON_MECHANISM: &str = "No mutually supported authentication mechanism";
    pub const ERR_TOO_MANY_MECHANISMS: &str = "Too many authentication mechanisms to offer";
    pub const ERR_AUTH_LEVEL_MISMATCH: &str = "PDU auth level differs from the negotiated level";
}

/// Reasons a byte string failed to decode as NDR.
///
/// Every malformed input maps to one of these; the decoder never panics and never
/// reads outside the buffer it was given.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("declared count {count} exceeds what the remaining {remaining} bytes can hold")]
    CountExceedsBuffer { count: u64, remaining: usize },

    #[error("declared count {count} exceeds the element ceiling {limit}")]
    CountExceedsLimit { count: u64, limit: usize },

    #[error("inconsistent array bounds: offset {offset} + actual {actual} > maximum {max}")]
    InconsistentBounds { offset: u64, actual: u64, max: u64 },

    #[error("fixed or varying array declared {declared} elements, expected at most {expected}")]
    ArraySizeMismatch { declared: u64, expected: u64 },

    #[error("union discriminant {0} has no matching arm")]
    UnknownDiscriminant(i64),

    #[error("string is missing its terminator")]
    MissingTerminator,

    #[error("string has zero length; the terminator is mandatory")]
    EmptyString,

    #[error("string contents are not valid text")]
    InvalidString,

    #[error("null referent for a reference pointer")]
    NullReference,

    #[error("referent id {0:#x} was already used by a unique pointer")]
    DuplicateReferent(u64),

    #[error("referent id {0:#x} refers to a value of a different type")]
    ReferentTypeMismatch(u64),

    #[error("referent id {0:#x} forms a cycle")]
    CyclicReference(u64),

    #[error("pointer nesting exceeds depth limit {0}")]
    DepthExceeded(usize),

    #[error("unsupported data representation: {0}")]
    UnsupportedRepresentation(&'static str),

    #[error("value out of range for its wire type: {0}")]
    OutOfRange(&'static str),

    #[error("{0} trailing bytes after the encoded value")]
    TrailingBytes(usize),

    #[error("type descriptor is not decodable: {0}")]
    InvalidDescriptor(&'static str),

    #[error("decoded value does not have the shape of {0}")]
    UnexpectedValue(&'static str),
}

/// Reasons a value could not be encoded as NDR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("value does not match its type descriptor (expected {expected})")]
    TypeMismatch { expected: &'static str },

    #[error("reference pointers cannot be null")]
    NullReference,

    #[error("union discriminant {0} has no matching arm")]
    UnknownDiscriminant(i64),

    #[error("fixed array needs {expected} elements, got {actual}")]
    FixedArrayLength { expected: usize, actual: usize },

    #[error("varying array holds {actual} elements, more than its maximum {max}")]
    VaryingArrayOverflow { max: usize, actual: usize },

    #[error("string contains an embedded terminator")]
    InteriorTerminator,

    #[error("character does not fit the narrow character set")]
    NonAsciiCharacter,

    #[error("count {0} does not fit the wire representation")]
    CountOverflow(usize),

    #[error("value out of range for its wire type: {0}")]
    OutOfRange(&'static str),

    #[error("unsupported data representation: {0}")]
    UnsupportedRepresentation(&'static str),

    #[error("type descriptor is not encodable: {0}")]
    InvalidDescriptor(&'static str),
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Negotiation failed: {0}")]
    NegotiationError(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Framing error: {0}")]
    FramingError(String),

    #[error("Invalid PDU header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("Fragment too large: {0} bytes")]
    OversizedFragment(usize),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Authentication sequence error: expected {expected}, received {received}")]
    AuthSequenceError { expected: u32, received: u32 },

    #[error("Server fault: status {status:#010x}")]
    Fault { status: u32 },

    #[error("Operation {0} not implemented")]
    UnimplementedOperation(u16),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected PDU type")]
    UnexpectedMessage,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True when the connection that produced this error can no longer be used.
    ///
    /// Faults, timeouts, codec errors and unimplemented operations only fail the
    /// call that observed them.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::TransportError(_)
                | ProtocolError::NegotiationError(_)
                | ProtocolError::InvalidHeader
                | ProtocolError::UnsupportedVersion(..)
                | ProtocolError::OversizedFragment(_)
                | ProtocolError::AuthError(_)
                | ProtocolError::AuthSequenceError { .. }
                | ProtocolError::ConnectionClosed
        )
    }

    /// A copy of this error for fanning one failure out to every pending call.
    ///
    /// I/O errors are not cloneable and become [`ProtocolError::TransportError`].
    pub fn duplicate(&self) -> Self {
        match self {
            ProtocolError::Io(e) => ProtocolError::TransportError(e.to_string()),
            ProtocolError::TransportError(s) => ProtocolError::TransportError(s.clone()),
            ProtocolError::NegotiationError(s) => ProtocolError::NegotiationError(s.clone()),
            ProtocolError::Decode(e) => ProtocolError::Decode(e.clone()),
            ProtocolError::Encode(e) => ProtocolError::Encode(e.clone()),
            ProtocolError::FramingError(s) => ProtocolError::FramingError(s.clone()),
            ProtocolError::InvalidHeader => ProtocolError::InvalidHeader,
            ProtocolError::UnsupportedVersion(a, b) => ProtocolError::UnsupportedVersion(*a, *b),
            ProtocolError::OversizedFragment(n) => ProtocolError::OversizedFragment(*n),
            ProtocolError::AuthError(s) => ProtocolError::AuthError(s.clone()),
            ProtocolError::AuthSequenceError { expected, received } => {
                ProtocolError::AuthSequenceError {
                    expected: *expected,
                    received: *received,
                }
            }
            ProtocolError::Fault { status } => ProtocolError::Fault { status: *status },
            ProtocolError::UnimplementedOperation(op) => ProtocolError::UnimplementedOperation(*op),
            ProtocolError::Timeout => ProtocolError::Timeout,
            ProtocolError::ConnectionClosed => ProtocolError::ConnectionClosed,
            ProtocolError::UnexpectedMessage => ProtocolError::UnexpectedMessage,
            ProtocolError::ConfigError(s) => ProtocolError::ConfigError(s.clone()),
            ProtocolError::Custom(s) => ProtocolError::Custom(s.clone()),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(!ProtocolError::Fault { status: 5 }.is_connection_fatal());
        assert!(!ProtocolError::Timeout.is_connection_fatal());
        assert!(!ProtocolError::Decode(DecodeError::MissingTerminator).is_connection_fatal());
        assert!(!ProtocolError::UnimplementedOperation(7).is_connection_fatal());
        assert!(ProtocolError::ConnectionClosed.is_connection_fatal());
        assert!(ProtocolError::AuthSequenceError {
            expected: 2,
            received: 1
        }
        .is_connection_fatal());
    }

    #[test]
    fn test_duplicate_keeps_fatality() {
        let io = ProtocolError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let copy = io.duplicate();
        assert!(matches!(copy, ProtocolError::TransportError(_)));
        assert!(copy.is_connection_fatal());

        let seq = ProtocolError::AuthSequenceError {
            expected: 3,
            received: 1,
        };
        assert!(matches!(
            seq.duplicate(),
            ProtocolError::AuthSequenceError {
                expected: 3,
                received: 1
            }
        ));
    }

    #[test]
    fn test_fault_display_is_hex() {
        let e = ProtocolError::Fault { status: 0x1c010002 };
        assert_eq!(e.to_string(), "Server fault: status 0x1c010002");
    }
}
