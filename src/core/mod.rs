//! # Core Protocol Components
//!
//! Wire-level building blocks: the NDR codec, PDU layout, stream framing and
//! fragment reassembly.
//!
//! ## Components
//! - **Syntax**: UUIDs, syntax identifiers, transfer syntaxes, data representation labels
//! - **NDR**: Network Data Representation encoder and decoder (NDR 2.0 and NDR64)
//! - **PDU**: Connection-oriented headers, bodies and the authentication trailer
//! - **Codec**: Tokio codec for cutting a byte stream into fragments
//! - **Fragment**: Body splitting and per-call reassembly
//!
//! ## Wire Format
//! ```text
//! [vers=5] [minor=0] [ptype] [flags] [drep(4)] [frag_len(2)] [auth_len(2)] [call_id(4)] [body] [auth]
//! ```
//!
//! ## Security
//! - Fragment size is bounded by the negotiated receive size before buffering
//! - NDR size fields are checked against the remaining input before allocation
//! - Pointer resolution depth is bounded

pub mod codec;
pub mod fragment;
pub mod ndr;
pub mod pdu;
pub mod syntax;
