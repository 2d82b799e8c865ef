//! # dcerpc-engine
//!
//! Connection-oriented DCE/RPC: NDR marshalling, PDU framing and
//! fragmentation, pluggable authentication, client connections and a
//! dispatching server.
//!
//! ## Layers
//! - [`core`]: NDR codec, PDU layout, stream framing, reassembly
//! - [`security`]: security contexts and the mechanisms behind them
//! - [`transport`]: string bindings and byte streams (TCP, local sockets, named pipes)
//! - [`protocol`]: client connections, server associations, dispatch
//! - [`service`]: the ready-to-run [`RpcServer`](service::RpcServer)
//!
//! ## Example
//! ```no_run
//! use dcerpc_engine::core::syntax::{SyntaxId, Uuid};
//! use dcerpc_engine::protocol::{Connection, ConnectionOptions, ContextRequest};
//! use dcerpc_engine::transport::StringBinding;
//!
//! # async fn run() -> dcerpc_engine::error::Result<()> {
//! let iface = SyntaxId::new("12345778-1234-abcd-ef00-0123456789ab".parse::<Uuid>()?, 1, 0);
//! let binding: StringBinding = "ncacn_ip_tcp:127.0.0.1[4135]".parse()?;
//! let conn = Connection::open(&binding, &[ContextRequest::ndr20(iface)], ConnectionOptions::default()).await?;
//! let sum: u32 = conn.call(0, 0, &(2u32, 3u32)).await?;
//! # let _ = sum;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod security;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::RpcConfig;
pub use error::{ProtocolError, Result};
pub use protocol::{Connection, ConnectionOptions, ContextRequest, DispatchTable};
pub use service::{RpcServer, ServerOptions};
