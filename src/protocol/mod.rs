//! # Protocol Layer
//!
//! Associations between a client and a server: binding, authentication legs,
//! call multiplexing and server-side dispatch.
//!
//! ## Components
//! - **Presentation**: Context requests, negotiation and per-association context sets
//! - **Connection**: Client association with concurrent, out-of-order calls
//! - **Association**: Server side of one connection
//! - **Dispatcher**: Opnum tables, interfaces and the registry that serves them
//!
//! ## Connection Flow
//! ```text
//! Client                                 Server
//!   | --- bind [+ auth token] ----------->  |
//!   | <-- bind_ack / bind_nak [+ token] ---  |
//!   | --- alter_context / auth3 [token] ->  |   (multi-leg mechanisms only)
//!   | --- request (fragments) ----------->  |
//!   | <-- response (fragments) / fault ----  |
//! ```

mod channel;

pub mod association;
pub mod connection;
pub mod dispatcher;
pub mod presentation;


pub use association::{serve_association, AssociationSettings};
pub use connection::{CallOptions, Connection, ConnectionOptions, ConnectionState};
pub use dispatcher::{
    CallContext, DispatchTable, HandlerError, HandlerResult, Interface, InterfaceRegistry,
};
pub use presentation::{ContextRequest, Negotiated, PresentationContext};
