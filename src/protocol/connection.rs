//! # Client Connection
//!
//! One association with a server: transport, negotiated presentation
//! contexts, an optional security context and the calls in flight.
//!
//! ## Lifecycle
//! ```text
//! Unbound -> Negotiating -> Bound -> Active -> Closed
//!                 |                               ^
//!                 +-------- rejection ------------+
//! ```
//!
//! [`Connection::open`] dials and binds; [`Connection::establish`] binds over
//! a stream the caller already holds. The handle is cheap to clone and calls
//! may be issued from many tasks at once. A dedicated read task demultiplexes
//! responses by call id; a caller waits only on its own response.
//!
//! ## Failure Handling
//! - A fault, timeout or undecodable response fails only its call
//! - Transport, framing and security failures close the connection and every
//!   pending call receives the same error

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{ClientConfig, RpcConfig, SecurityConfig};
use crate::core::fragment::Reassembler;
use crate::core::ndr::{from_ndr, to_ndr, NdrType};
use crate::core::pdu::{
    BindAckPdu, BindNakReason, BindPdu, PacketType, Pdu, PduBody, RequestPdu,
    MUST_RECV_FRAG_SIZE, REQUEST_PREFIX_SIZE,
};
use crate::core::syntax::{DataRepresentation, NdrFormat, SyntaxId, Uuid};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::{self, header_call_id, lock, Channel, PduReader};
use crate::protocol::presentation::{ContextRequest, ContextSet, PresentationContext};
use crate::security::{
    AuthLevel, MechanismProvider, NegotiateProvider, Role, SecurityContext, StepStatus,
};
use crate::transport::{self, BoxedStream, RpcStream, StringBinding};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::with_timeout;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport attached, nothing sent yet.
    Unbound,
    Negotiating,
    Bound,
    Active,
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle allows moving from `self` to `next`. Every state
    /// but `Closed` may close; nothing leaves `Closed`.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Unbound, Negotiating) | (Negotiating, Bound) | (Bound, Active) => true,
            _ => false,
        }
    }
}

/// Everything a connection needs beyond the binding.
///
/// Mechanism providers live here rather than in any global registry; they are
/// scoped to the connections opened with these options.
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    pub config: ClientConfig,
    pub security: SecurityConfig,
    pub providers: Vec<Arc<dyn MechanismProvider>>,
}

impl ConnectionOptions {
    pub fn new(config: ClientConfig, security: SecurityConfig) -> Self {
        Self {
            config,
            security,
            providers: Vec::new(),
        }
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(config.client.clone(), config.security.clone())
    }

    pub fn with_provider(mut self, provider: Arc<dyn MechanismProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_level(mut self, level: AuthLevel) -> Self {
        self.security.level = level;
        self
    }

    /// Providers named in the security configuration, in its order.
    fn selected_providers(&self) -> Vec<Arc<dyn MechanismProvider>> {
        self.security
            .mechanisms
            .iter()
            .filter_map(|name| self.providers.iter().find(|p| p.name() == name))
            .cloned()
            .collect()
    }

    /// The provider to authenticate with, or `None` for an unauthenticated bind.
    fn provider(&self) -> Result<Option<Arc<dyn MechanismProvider>>> {
        if self.security.level == AuthLevel::None {
            return Ok(None);
        }
        let mut selected = self.selected_providers();
        match selected.len() {
            0 if self.security.allow_unauthenticated_fallback => {
                warn!("No configured mechanism is available; continuing unauthenticated");
                Ok(None)
            }
            0 => Err(ProtocolError::AuthError(constants::ERR_NO_COMMON_MECHANISM.into())),
            1 => Ok(selected.pop()),
            _ => Ok(Some(Arc::new(NegotiateProvider::new(selected)))),
        }
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("config", &self.config)
            .field("security", &self.security)
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub object: Option<Uuid>,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

type Pending = HashMap<u32, oneshot::Sender<Result<Pdu>>>;

struct Inner {
    channel: Channel,
    contexts: RwLock<ContextSet>,
    pending: Mutex<Pending>,
    state: Mutex<ConnectionState>,
    next_call_id: AtomicU32,
    /// Configured group until the bind acknowledgment assigns one.
    assoc_group_id: AtomicU32,
    /// Largest fragment the server may send us, as negotiated at bind.
    max_recv_frag: AtomicU16,
    call_timeout: Duration,
    peer: String,
    /// Serializes alter-context exchanges so context ids are not handed out twice.
    alter_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut s) = self.state.lock() {
            if s.can_advance_to(state) {
                *s = state;
            } else {
                debug!(from = ?*s, to = ?state, "Ignoring state change");
            }
        }
    }

    fn assoc_group_id(&self) -> u32 {
        self.assoc_group_id.load(Ordering::Relaxed)
    }

    fn max_recv_frag(&self) -> u16 {
        self.max_recv_frag.load(Ordering::Relaxed)
    }

    fn next_call_id(&self) -> u32 {
        loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn register(&self, call_id: u32) -> Result<oneshot::Receiver<Result<Pdu>>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending)?.insert(call_id, tx);
        Ok(rx)
    }

    /// Hand a PDU or error to the caller waiting on `call_id`. Late answers
    /// for abandoned calls are dropped here.
    fn deliver(&self, call_id: u32, result: Result<Pdu>) {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&call_id));
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(call_id, "Discarding response for an abandoned call"),
        }
    }

    /// Close the connection and fail every pending call with `err`.
    fn fail(&self, err: &ProtocolError) {
        let was = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };
        if was != ConnectionState::Closed {
            global_metrics().connection_closed();
        }
        self.channel.clear_security();
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => Vec::new(),
        };
        if !drained.is_empty() {
            warn!(error = %err, calls = drained.len(), "Failing pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(err.duplicate()));
        }
        self.shutdown.send_replace(true);
    }

    fn require_active(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Active => Ok(()),
            ConnectionState::Closed => Err(ProtocolError::ConnectionClosed),
            _ => Err(ProtocolError::Custom(constants::ERR_NOT_ACTIVE.into())),
        }
    }

    async fn send_request(
        &self,
        call_id: u32,
        context_id: u16,
        opnum: u16,
        object: Option<Uuid>,
        stub: Bytes,
    ) -> Result<()> {
        let prefix = REQUEST_PREFIX_SIZE + if object.is_some() { 16 } else { 0 };
        let result = self
            .channel
            .send_stub(call_id, stub, prefix, |alloc_hint, chunk| {
                PduBody::Request(RequestPdu {
                    alloc_hint,
                    context_id,
                    opnum,
                    object,
                    stub: chunk,
                })
            })
            .await;
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                self.fail(e);
            }
        }
        result
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if self.state() != ConnectionState::Closed {
            global_metrics().connection_closed();
        }
    }
}

/// Removes a call from the pending map however the caller stops waiting.
struct PendingGuard<'a> {
    inner: &'a Inner,
    call_id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&self.call_id);
        }
    }
}

/// A bound connection. Clones share the same association.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Dial `binding` and bind `contexts`.
    ///
    /// With `allow_unauthenticated_fallback` set, a failed authentication is
    /// retried once over a fresh transport without a security context.
    #[instrument(skip_all, fields(binding = %binding))]
    pub async fn open(
        binding: &StringBinding,
        contexts: &[ContextRequest],
        options: ConnectionOptions,
    ) -> Result<Self> {
        let connect_timeout = options.config.connect_timeout;
        let attempt = with_timeout(connect_timeout, async {
            let (stream, peer) = transport::connect(binding).await?;
            Self::establish_boxed(stream, peer, contexts, options.clone()).await
        })
        .await;

        match attempt {
            Err(ProtocolError::AuthError(reason))
                if options.security.allow_unauthenticated_fallback =>
            {
                warn!(%reason, "Authentication failed; retrying without a security context");
                let fallback = options.with_level(AuthLevel::None);
                with_timeout(connect_timeout, async {
                    let (stream, peer) = transport::connect(binding).await?;
                    Self::establish_boxed(stream, peer, contexts, fallback).await
                })
                .await
            }
            other => other,
        }
    }

    /// Bind over an already connected stream.
    pub async fn establish<S: RpcStream>(
        stream: S,
        peer: impl Into<String>,
        contexts: &[ContextRequest],
        options: ConnectionOptions,
    ) -> Result<Self> {
        Self::establish_boxed(Box::new(stream), peer.into(), contexts, options).await
    }

    #[instrument(skip_all, fields(peer = %peer))]
    async fn establish_boxed(
        stream: BoxedStream,
        peer: String,
        contexts: &[ContextRequest],
        options: ConnectionOptions,
    ) -> Result<Self> {
        let _timer = Timer::start("bind");
        if contexts.is_empty() {
            return Err(ProtocolError::NegotiationError(
                "no presentation contexts requested".into(),
            ));
        }
        let config = &options.config;
        let drep = DataRepresentation::new(config.integer_order);
        let max_recv_frag = config.max_recv_frag.max(MUST_RECV_FRAG_SIZE);
        let max_xmit_frag = config.max_xmit_frag.max(MUST_RECV_FRAG_SIZE);
        let (mut reader, writer) = channel::split(stream, max_recv_frag, max_xmit_frag);

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            channel: Channel::new(writer, drep, max_xmit_frag),
            contexts: RwLock::new(ContextSet::new()),
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Unbound),
            next_call_id: AtomicU32::new(1),
            assoc_group_id: AtomicU32::new(config.assoc_group_id),
            max_recv_frag: AtomicU16::new(max_recv_frag),
            call_timeout: config.call_timeout,
            peer: peer.clone(),
            alter_lock: tokio::sync::Mutex::new(()),
            shutdown,
        });
        global_metrics().connection_established();
        global_metrics().bind_attempt();

        let mut security = match options.provider()? {
            Some(provider) => Some(SecurityContext::new(
                provider.create(Role::Initiator),
                options.security.level,
                0,
                peer.as_str(),
                options.security.target_name.as_str(),
            )),
            None => None,
        };

        let bind_call = inner.next_call_id();
        let mut bind = Pdu::new(
            bind_call,
            drep,
            PduBody::Bind(BindPdu {
                max_xmit_frag,
                max_recv_frag,
                assoc_group_id: config.assoc_group_id,
                contexts: contexts
                    .iter()
                    .enumerate()
                    .map(|(i, c)| c.to_element(i as u16))
                    .collect(),
            }),
        );
        if let Some(sec) = security.as_mut() {
            if let Some(token) = sec.initialize(None)?.token {
                bind = bind.with_auth(sec.token_trailer(token));
            }
        }

        let result = async {
            inner.set_state(ConnectionState::Negotiating);
            inner.channel.send_pdu(bind).await?;
            let reply = read_pdu(&mut reader).await?;
            let ack = match reply.body {
                PduBody::BindAck(ack) => ack,
                PduBody::BindNak(nak) => {
                    global_metrics().bind_rejected();
                    return Err(match nak.reason {
                        BindNakReason::AuthenticationTypeNotRecognized
                        | BindNakReason::InvalidChecksum => {
                            global_metrics().auth_failure();
                            ProtocolError::AuthError(format!("bind rejected: {:?}", nak.reason))
                        }
                        reason => {
                            ProtocolError::NegotiationError(format!("bind rejected: {reason:?}"))
                        }
                    });
                }
                _ => return Err(ProtocolError::UnexpectedMessage),
            };
            let server_token = reply.auth.map(|a| a.verifier);
            let ack_group = apply_bind_ack(&inner, contexts, &ack)?;
            inner.set_state(ConnectionState::Bound);

            if let Some(sec) = security.as_mut() {
                if !sec.is_established() {
                    authenticate(&inner, &mut reader, sec, bind_call, server_token).await?;
                }
            }
            Ok(ack_group)
        }
        .await;

        let assoc_group_id = match result {
            Ok(group) => group,
            Err(e) => {
                inner.fail(&e);
                inner.channel.close().await;
                return Err(e);
            }
        };

        if let Some(sec) = security {
            info!(
                mechanism = sec.mechanism_name(),
                level = ?sec.level(),
                "Security context established"
            );
            inner.channel.install_security(sec)?;
        }
        inner.set_state(ConnectionState::Active);
        debug!(
            assoc_group_id,
            max_xmit_frag = inner.channel.max_xmit_frag(),
            "Connection active"
        );

        let reassembler = Reassembler::new(config.max_call_size);
        tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            reader,
            reassembler,
            inner.shutdown.subscribe(),
        ));

        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Negotiated contexts, accepted and rejected.
    pub fn contexts(&self) -> Vec<PresentationContext> {
        self.inner
            .contexts
            .read()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Id of the first accepted context for `interface`.
    pub fn context_for(&self, interface: &SyntaxId) -> Option<u16> {
        self.inner
            .contexts
            .read()
            .ok()
            .and_then(|set| set.find_interface(interface).map(|c| c.id))
    }

    pub fn max_xmit_frag(&self) -> u16 {
        self.inner.channel.max_xmit_frag()
    }

    /// Largest fragment the server agreed to send.
    pub fn max_recv_frag(&self) -> u16 {
        self.inner.max_recv_frag()
    }

    pub fn assoc_group_id(&self) -> u32 {
        self.inner.assoc_group_id()
    }

    pub fn auth_level(&self) -> AuthLevel {
        self.inner.channel.security_info().0
    }

    /// Name of the mechanism that authenticated this connection.
    pub fn mechanism(&self) -> Option<&'static str> {
        self.inner.channel.security_info().1
    }

    /// Negotiate more presentation contexts. Existing contexts are untouched.
    #[instrument(skip(self, contexts), fields(count = contexts.len()))]
    pub async fn alter_context(&self, contexts: &[ContextRequest]) -> Result<Vec<PresentationContext>> {
        self.inner.require_active()?;
        let _alter = self.inner.alter_lock.lock().await;
        global_metrics().bind_attempt();

        let first_id = lock_read(&self.inner.contexts)?.next_id();
        let elements = contexts
            .iter()
            .enumerate()
            .map(|(i, c)| c.to_element(first_id.wrapping_add(i as u16)))
            .collect();

        let call_id = self.inner.next_call_id();
        let rx = self.inner.register(call_id)?;
        let _guard = PendingGuard {
            inner: &self.inner,
            call_id,
        };
        let inner = &self.inner;
        let reply = with_timeout(inner.call_timeout, async {
            inner
                .channel
                .send_pdu(Pdu::new(
                    call_id,
                    inner.channel.drep(),
                    PduBody::AlterContext(BindPdu {
                        max_xmit_frag: inner.channel.max_xmit_frag(),
                        max_recv_frag: inner.max_recv_frag(),
                        assoc_group_id: inner.assoc_group_id(),
                        contexts: elements,
                    }),
                ))
                .await?;
            rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
        })
        .await?;

        let ack = match reply.body {
            PduBody::AlterContextResponse(ack) => ack,
            PduBody::Fault(f) => {
                global_metrics().fault();
                return Err(ProtocolError::Fault { status: f.status });
            }
            _ => return Err(ProtocolError::UnexpectedMessage),
        };
        if ack.results.len() != contexts.len() {
            return Err(ProtocolError::NegotiationError(format!(
                "{} results for {} contexts",
                ack.results.len(),
                contexts.len()
            )));
        }

        let mut added = Vec::with_capacity(contexts.len());
        let mut set = lock_write(&self.inner.contexts)?;
        for (i, (request, result)) in contexts.iter().zip(&ack.results).enumerate() {
            let ctx = PresentationContext::from_result(request, first_id.wrapping_add(i as u16), result)?;
            set.insert(ctx);
            added.push(ctx);
        }
        debug!(accepted = added.iter().filter(|c| c.is_accepted()).count(), "Alter context complete");
        Ok(added)
    }

    /// Call `opnum` with raw stub bytes; returns the raw response stub.
    pub async fn call_raw(&self, context_id: u16, opnum: u16, stub: impl Into<Bytes>) -> Result<Bytes> {
        let (stub, _) = self
            .call_with(context_id, opnum, stub.into(), CallOptions::default())
            .await?;
        Ok(stub)
    }

    /// Encode `request`, call `opnum` and decode the response.
    pub async fn call<Req, Resp>(&self, context_id: u16, opnum: u16, request: &Req) -> Result<Resp>
    where
        Req: NdrType,
        Resp: NdrType,
    {
        self.call_typed(context_id, opnum, request, CallOptions::default())
            .await
    }

    pub async fn call_typed<Req, Resp>(
        &self,
        context_id: u16,
        opnum: u16,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp>
    where
        Req: NdrType,
        Resp: NdrType,
    {
        let format = self.format(context_id)?;
        let stub = to_ndr(request, &format)?;
        let (response, drep) = self
            .call_with(context_id, opnum, Bytes::from(stub), options)
            .await?;
        Ok(from_ndr(&response, &NdrFormat::new(format.syntax, drep))?)
    }

    /// Codec settings for requests on `context_id`.
    pub fn format(&self, context_id: u16) -> Result<NdrFormat> {
        lock_read(&self.inner.contexts)?
            .accepted(context_id)?
            .format(self.inner.channel.drep())
    }

    /// Issue one call; returns the response stub and the sender's data representation.
    #[instrument(skip(self, stub, options), fields(call_id = tracing::field::Empty, len = stub.len()))]
    pub async fn call_with(
        &self,
        context_id: u16,
        opnum: u16,
        stub: Bytes,
        options: CallOptions,
    ) -> Result<(Bytes, DataRepresentation)> {
        self.inner.require_active()?;
        lock_read(&self.inner.contexts)?.accepted(context_id)?;

        let call_id = self.inner.next_call_id();
        tracing::Span::current().record("call_id", call_id);
        global_metrics().call_started();

        let rx = self.inner.register(call_id)?;
        let _guard = PendingGuard {
            inner: &self.inner,
            call_id,
        };
        let deadline = Instant::now() + options.timeout.unwrap_or(self.inner.call_timeout);

        // The send runs on its own task so an expiring deadline never stops
        // a call halfway through its fragments.
        let inner = Arc::clone(&self.inner);
        let send = tokio::spawn(async move {
            inner
                .send_request(call_id, context_id, opnum, options.object, stub)
                .await
        });

        let outcome = async {
            send.await
                .map_err(|e| ProtocolError::Custom(format!("send task failed: {e}")))??;
            rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
        };
        let reply = match tokio::time::timeout_at(deadline, outcome).await {
            Ok(result) => result?,
            Err(_) => {
                global_metrics().timeout();
                warn!(call_id, opnum, "Call timed out");
                self.orphan(call_id);
                return Err(ProtocolError::Timeout);
            }
        };

        match reply.body {
            PduBody::Response(resp) => {
                if resp.context_id != context_id {
                    global_metrics().protocol_error();
                    warn!(call_id, expected = context_id, got = resp.context_id, "Response on another context");
                    return Err(ProtocolError::FramingError(
                        constants::ERR_RESPONSE_CONTEXT_MISMATCH.into(),
                    ));
                }
                trace!(call_id, len = resp.stub.len(), "Call complete");
                Ok((resp.stub, reply.drep))
            }
            PduBody::Fault(f) => {
                global_metrics().fault();
                debug!(call_id, status = f.status, "Server fault");
                Err(ProtocolError::Fault { status: f.status })
            }
            _ => Err(ProtocolError::UnexpectedMessage),
        }
    }

    /// Tell the server a timed-out call is abandoned. Best effort.
    fn orphan(&self, call_id: u32) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if inner.state() != ConnectionState::Active {
                return;
            }
            let pdu = Pdu::new(call_id, inner.channel.drep(), PduBody::Orphaned);
            if let Err(e) = inner.channel.send_pdu(pdu).await {
                debug!(call_id, error = %e, "Failed to send orphaned notice");
            }
        });
    }

    /// Release the transport and security context; pending calls fail with
    /// [`ProtocolError::ConnectionClosed`].
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.inner.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.inner.fail(&ProtocolError::ConnectionClosed);
        self.inner.channel.close().await;
        info!("Connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("state", &self.inner.state())
            .field("assoc_group_id", &self.inner.assoc_group_id())
            .finish()
    }
}

fn lock_read<T>(l: &RwLock<T>) -> Result<std::sync::RwLockReadGuard<'_, T>> {
    l.read()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
}

fn lock_write<T>(l: &RwLock<T>) -> Result<std::sync::RwLockWriteGuard<'_, T>> {
    l.write()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
}

/// Read and parse the next PDU during the bind exchange.
async fn read_pdu(reader: &mut PduReader) -> Result<Pdu> {
    let frag = reader.next().await.ok_or(ProtocolError::ConnectionClosed)??;
    global_metrics().fragment_received(frag.len() as u64);
    Pdu::decode(&frag)
}

/// Record the negotiated sizes and contexts; returns the association group.
fn apply_bind_ack(inner: &Inner, requested: &[ContextRequest], ack: &BindAckPdu) -> Result<u32> {
    if ack.results.len() != requested.len() {
        return Err(ProtocolError::NegotiationError(format!(
            "{} results for {} contexts",
            ack.results.len(),
            requested.len()
        )));
    }
    let max_xmit = inner
        .channel
        .max_xmit_frag()
        .min(ack.max_recv_frag)
        .max(MUST_RECV_FRAG_SIZE);
    inner.channel.set_max_xmit_frag(max_xmit);
    let max_recv = inner
        .max_recv_frag()
        .min(ack.max_xmit_frag)
        .max(MUST_RECV_FRAG_SIZE);
    inner.max_recv_frag.store(max_recv, Ordering::Relaxed);

    let mut set = lock_write(&inner.contexts)?;
    for (i, (request, result)) in requested.iter().zip(&ack.results).enumerate() {
        let ctx = PresentationContext::from_result(request, i as u16, result)?;
        if !ctx.is_accepted() {
            debug!(context_id = ctx.id, outcome = ?ctx.outcome, "Context rejected");
        }
        set.insert(ctx);
    }
    if set.accepted_count() == 0 {
        global_metrics().bind_rejected();
        return Err(ProtocolError::NegotiationError(
            constants::ERR_NO_CONTEXT_ACCEPTED.into(),
        ));
    }
    inner.assoc_group_id.store(ack.assoc_group_id, Ordering::Relaxed);
    Ok(ack.assoc_group_id)
}

/// Finish the token exchange after the bind acknowledgment.
///
/// An established step with a token goes out in an auth3; a continuing step
/// goes out in an alter-context and the loop resumes on its response.
async fn authenticate(
    inner: &Inner,
    reader: &mut PduReader,
    sec: &mut SecurityContext,
    bind_call: u32,
    server_token: Option<Bytes>,
) -> Result<()> {
    let drep = inner.channel.drep();
    let mut token = server_token.ok_or_else(|| {
        ProtocolError::AuthError("server did not answer the authentication token".into())
    })?;

    loop {
        let step = sec.initialize(Some(token.as_ref()))?;
        match step.status {
            StepStatus::Established => {
                if let Some(out) = step.token {
                    let auth3 = Pdu::new(bind_call, drep, PduBody::Auth3)
                        .with_auth(sec.token_trailer(out));
                    inner.channel.send_pdu(auth3).await?;
                }
                return Ok(());
            }
            StepStatus::Continue => {
                let out = step.token.ok_or_else(|| {
                    ProtocolError::AuthError("mechanism produced no token to continue".into())
                })?;
                let alter = Pdu::new(
                    bind_call,
                    drep,
                    PduBody::AlterContext(BindPdu {
                        max_xmit_frag: inner.channel.max_xmit_frag(),
                        max_recv_frag: inner.max_recv_frag(),
                        assoc_group_id: inner.assoc_group_id(),
                        contexts: Vec::new(),
                    }),
                )
                .with_auth(sec.token_trailer(out));
                inner.channel.send_pdu(alter).await?;

                let reply = read_pdu(reader).await?;
                match reply.body {
                    PduBody::AlterContextResponse(_) => {}
                    PduBody::Fault(f) => {
                        global_metrics().auth_failure();
                        return Err(ProtocolError::AuthError(format!(
                            "server refused authentication: status {:#010x}",
                            f.status
                        )));
                    }
                    _ => return Err(ProtocolError::UnexpectedMessage),
                }
                token = reply.auth.map(|a| a.verifier).ok_or_else(|| {
                    ProtocolError::AuthError("server ended the exchange early".into())
                })?;
            }
            StepStatus::Failed(reason) => return Err(ProtocolError::AuthError(reason)),
        }
    }
}

/// Demultiplex inbound fragments to the calls waiting for them.
async fn read_loop(
    inner: Weak<Inner>,
    mut reader: PduReader,
    mut reassembler: Reassembler,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = reader.next() => frame,
        };
        let Some(inner) = inner.upgrade() else { break };

        let mut frag: BytesMut = match frame {
            Some(Ok(frag)) => frag,
            Some(Err(e)) => {
                global_metrics().protocol_error();
                error!(error = %e, "Unrecoverable framing error");
                inner.fail(&e);
                break;
            }
            None => {
                debug!("Server closed the transport");
                inner.fail(&ProtocolError::ConnectionClosed);
                break;
            }
        };
        global_metrics().fragment_received(frag.len() as u64);

        if let Err(e) = inner.channel.unprotect(&mut frag) {
            error!(error = %e, "Rejecting protected fragment");
            inner.fail(&e);
            break;
        }

        let pdu = match Pdu::decode(&frag) {
            Ok(pdu) => pdu,
            Err(e) => {
                global_metrics().protocol_error();
                match header_call_id(&frag) {
                    Some(call_id) => {
                        reassembler.discard(call_id);
                        inner.deliver(call_id, Err(e));
                        continue;
                    }
                    None => {
                        inner.fail(&e);
                        break;
                    }
                }
            }
        };

        let call_id = pdu.call_id;
        match pdu.packet_type() {
            PacketType::Response => match reassembler.push(pdu) {
                Ok(Some(whole)) => inner.deliver(call_id, Ok(whole)),
                Ok(None) => {}
                Err(e) => {
                    global_metrics().protocol_error();
                    inner.deliver(call_id, Err(e));
                }
            },
            PacketType::Fault | PacketType::AlterContextResponse | PacketType::BindNak => {
                reassembler.discard(call_id);
                inner.deliver(call_id, Ok(pdu));
            }
            PacketType::Shutdown => {
                info!("Server requested shutdown");
                inner.fail(&ProtocolError::ConnectionClosed);
                break;
            }
            ptype => {
                global_metrics().protocol_error();
                warn!(call_id, ?ptype, "Ignoring unexpected PDU");
            }
        }
    }
    trace!("Read loop finished");
}
