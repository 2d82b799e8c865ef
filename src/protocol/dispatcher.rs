//! Server-side opnum dispatch.
//!
//! A [`DispatchTable`] maps each opnum of one interface to an operation that
//! decodes the request stub, runs the handler and encodes the response. Tables
//! are collected in an [`InterfaceRegistry`] keyed by abstract syntax; the
//! association looks interfaces up there during bind and on every request.
//!
//! Handler failures never escape: errors and panics both come back as a
//! [`HandlerError`] carrying the fault status to send.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::ndr::{from_ndr, to_ndr, NdrType};
use crate::core::pdu::fault;
use crate::core::syntax::{NdrFormat, SyntaxId, Uuid};
use crate::error::{constants, ProtocolError, Result};
use crate::security::AuthLevel;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// A handler failure, sent to the client as a fault with `status`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("status {status:#010x}: {message}")]
pub struct HandlerError {
    pub status: u32,
    pub message: String,
}

impl HandlerError {
    pub fn new(status: u32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Status only; for application error codes.
    pub fn status(status: u32) -> Self {
        Self::new(status, "")
    }

    /// Fallback for operations an implementation does not provide.
    pub fn not_implemented(opnum: u16) -> Self {
        Self::new(
            fault::NCA_S_OP_RNG_ERROR,
            ProtocolError::UnimplementedOperation(opnum).to_string(),
        )
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        let status = match &err {
            ProtocolError::Decode(_) => fault::RPC_X_BAD_STUB_DATA,
            ProtocolError::UnimplementedOperation(_) => fault::NCA_S_OP_RNG_ERROR,
            ProtocolError::Fault { status } => *status,
            _ => fault::NCA_S_FAULT_UNSPEC,
        };
        Self::new(status, err.to_string())
    }
}

/// What a handler knows about the call it serves.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object: Option<Uuid>,
    /// Layout of the request stub; the response uses the same.
    pub format: NdrFormat,
    pub peer: Arc<str>,
    pub auth_level: AuthLevel,
    pub mechanism: Option<&'static str>,
}

/// One opnum's decode, invoke and encode steps over raw stub bytes.
pub trait Operation: Send + Sync + 'static {
    fn invoke(&self, stub: Bytes, ctx: CallContext) -> BoxFuture<'static, HandlerResult<Vec<u8>>>;
}

/// Wrapper that decodes the request and encodes the response around `F`.
pub struct TypedOperation<F, Req, Resp, Fut> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> TypedOperation<F, Req, Resp, Fut> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Req, Resp, Fut> Operation for TypedOperation<F, Req, Resp, Fut>
where
    F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
    Req: NdrType + Send + 'static,
    Resp: NdrType + Send + 'static,
    Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
{
    fn invoke(&self, stub: Bytes, ctx: CallContext) -> BoxFuture<'static, HandlerResult<Vec<u8>>> {
        let format = ctx.format;
        let request: Req = match from_ndr(&stub, &format) {
            Ok(v) => v,
            Err(e) => {
                warn!(opnum = ctx.opnum, error = %e, "Undecodable request stub");
                let err = HandlerError::from(ProtocolError::from(e));
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = (self.handler)(request, ctx);
        Box::pin(async move {
            let response = fut.await?;
            to_ndr(&response, &format).map_err(|e| HandlerError::from(ProtocolError::from(e)))
        })
    }
}

/// Handler over raw stub bytes, for interfaces with hand-written marshaling.
pub struct RawOperation<F, Fut> {
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> RawOperation<F, Fut> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Operation for RawOperation<F, Fut>
where
    F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Vec<u8>>> + Send + 'static,
{
    fn invoke(&self, stub: Bytes, ctx: CallContext) -> BoxFuture<'static, HandlerResult<Vec<u8>>> {
        Box::pin((self.handler)(stub, ctx))
    }
}

struct Entry {
    name: String,
    operation: Arc<dyn Operation>,
}

/// Opnum table for one interface.
pub struct DispatchTable {
    interface: SyntaxId,
    name: String,
    operations: HashMap<u16, Entry>,
}

impl DispatchTable {
    pub fn new(interface: SyntaxId, name: impl Into<String>) -> Self {
        Self {
            interface,
            name: name.into(),
            operations: HashMap::new(),
        }
    }

    /// Build a table from a capability-set implementation.
    pub fn for_interface<I: Interface>(implementation: I) -> Self {
        let implementation = Arc::new(implementation);
        let mut table = Self::new(implementation.syntax(), implementation.name());
        implementation.register(&mut table);
        table
    }

    pub fn interface(&self) -> SyntaxId {
        self.interface
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a typed operation. A later registration for the same opnum wins.
    pub fn register<F, Req, Resp, Fut>(&mut self, opnum: u16, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Req: NdrType + Send + 'static,
        Resp: NdrType + Send + 'static,
        Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
    {
        self.insert(opnum, name, Arc::new(TypedOperation::new(handler)))
    }

    /// Register an operation over raw stub bytes.
    pub fn register_raw<F, Fut>(&mut self, opnum: u16, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Vec<u8>>> + Send + 'static,
    {
        self.insert(opnum, name, Arc::new(RawOperation::new(handler)))
    }

    pub fn insert(&mut self, opnum: u16, name: &str, operation: Arc<dyn Operation>) -> &mut Self {
        if self.operations.contains_key(&opnum) {
            debug!(interface = %self.name, opnum, "Replacing operation");
        }
        self.operations.insert(
            opnum,
            Entry {
                name: name.to_string(),
                operation,
            },
        );
        self
    }

    pub fn operation_name(&self, opnum: u16) -> Option<&str> {
        self.operations.get(&opnum).map(|e| e.name.as_str())
    }

    pub fn contains(&self, opnum: u16) -> bool {
        self.operations.contains_key(&opnum)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Run opnum `ctx.opnum` against `stub`.
    ///
    /// Unknown opnums produce the not-implemented fault; a panicking handler
    /// produces an unspecified fault.
    pub async fn dispatch(&self, stub: Bytes, ctx: CallContext) -> HandlerResult<Vec<u8>> {
        let opnum = ctx.opnum;
        let Some(entry) = self.operations.get(&opnum) else {
            warn!(interface = %self.name, opnum, "Operation not implemented");
            return Err(HandlerError::not_implemented(opnum));
        };
        let operation = Arc::clone(&entry.operation);

        match AssertUnwindSafe(async move { operation.invoke(stub, ctx).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(interface = %self.name, operation = %entry.name, "Handler panicked");
                Err(HandlerError::new(fault::NCA_S_FAULT_UNSPEC, "handler panicked"))
            }
        }
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opnums: Vec<_> = self.operations.keys().copied().collect();
        opnums.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("interface", &self.interface)
            .field("name", &self.name)
            .field("opnums", &opnums)
            .finish()
    }
}

/// A server-side capability set for one interface.
///
/// Implementations register the operations they provide; opnums left out fall
/// back to the not-implemented fault, so large interfaces can be served
/// partially.
pub trait Interface: Send + Sync + 'static {
    fn syntax(&self) -> SyntaxId;

    fn name(&self) -> &'static str {
        "interface"
    }

    fn register(self: Arc<Self>, table: &mut DispatchTable);
}

/// Dispatch tables keyed by abstract syntax (UUID and version).
#[derive(Clone, Default)]
pub struct InterfaceRegistry {
    tables: Arc<RwLock<HashMap<SyntaxId, Arc<DispatchTable>>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the table for its interface.
    pub fn register(&self, table: DispatchTable) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;
        debug!(interface = %table.interface(), name = table.name(), "Registered interface");
        tables.insert(table.interface(), Arc::new(table));
        Ok(())
    }

    pub fn lookup(&self, interface: &SyntaxId) -> Result<Option<Arc<DispatchTable>>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.into()))?;
        Ok(tables.get(interface).cloned())
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("interfaces", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn iface() -> SyntaxId {
        SyntaxId::new(Uuid::from_fields(0xabcd_0001, 0, 0, [0; 8]), 1, 0)
    }

    fn ctx(opnum: u16) -> CallContext {
        CallContext {
            call_id: 1,
            context_id: 0,
            opnum,
            object: None,
            format: NdrFormat::ndr20(),
            peer: Arc::from("test"),
            auth_level: AuthLevel::None,
            mechanism: None,
        }
    }

    fn stub<T: NdrType>(v: &T) -> Bytes {
        Bytes::from(to_ndr(v, &NdrFormat::ndr20()).unwrap())
    }

    #[tokio::test]
    async fn test_typed_operation_roundtrip() {
        let mut table = DispatchTable::new(iface(), "calc");
        table.register(0, "Add", |(a, b): (u32, u32), _ctx| async move { Ok(a + b) });

        let out = table.dispatch(stub(&(2u32, 3u32)), ctx(0)).await.unwrap();
        let sum: u32 = from_ndr(&out, &NdrFormat::ndr20()).unwrap();
        assert_eq!(sum, 5);
        assert_eq!(table.operation_name(0), Some("Add"));
    }

    #[tokio::test]
    async fn test_unknown_opnum_is_not_implemented() {
        let table = DispatchTable::new(iface(), "empty");
        let err = table.dispatch(Bytes::new(), ctx(9)).await.unwrap_err();
        assert_eq!(err.status, fault::NCA_S_OP_RNG_ERROR);
    }

    #[tokio::test]
    async fn test_bad_stub_maps_to_bad_stub_data() {
        let mut table = DispatchTable::new(iface(), "calc");
        table.register(0, "Echo", |v: u32, _ctx| async move { Ok(v) });
        let err = table.dispatch(Bytes::from_static(&[1]), ctx(0)).await.unwrap_err();
        assert_eq!(err.status, fault::RPC_X_BAD_STUB_DATA);
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_fault() {
        let mut table = DispatchTable::new(iface(), "calc");
        table.register_raw(1, "Boom", |_stub, _ctx| async move {
            if true {
                panic!("handler bug");
            }
            Ok(Vec::new())
        });
        let err = table.dispatch(Bytes::new(), ctx(1)).await.unwrap_err();
        assert_eq!(err.status, fault::NCA_S_FAULT_UNSPEC);
    }

    struct Partial;

    impl Interface for Partial {
        fn syntax(&self) -> SyntaxId {
            iface()
        }

        fn name(&self) -> &'static str {
            "partial"
        }

        fn register(self: Arc<Self>, table: &mut DispatchTable) {
            table.register(2, "Ping", |(): (), _ctx| async move { Ok(()) });
        }
    }

    #[tokio::test]
    async fn test_interface_capability_set() {
        let table = DispatchTable::for_interface(Partial);
        assert_eq!(table.name(), "partial");
        assert!(table.contains(2));
        assert!(!table.contains(0));

        let registry = InterfaceRegistry::new();
        registry.register(table).unwrap();
        assert!(registry.lookup(&iface()).unwrap().is_some());
        let other = SyntaxId::new(iface().uuid, 2, 0);
        assert!(registry.lookup(&other).unwrap().is_none());
    }
}
