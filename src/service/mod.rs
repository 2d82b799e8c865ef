//! # Service Layer
//!
//! Ready-to-run server built on the protocol layer.

pub mod server;

pub use server::{RpcServer, ServerOptions};
