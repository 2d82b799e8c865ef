//! Server side of one connection.
//!
//! A single task reads fragments, answers bind, alter-context and auth3
//! legs inline and hands every completed request to its own task. Responses
//! from those tasks share the connection's [`Channel`], so they may complete
//! in any order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ServerConfig;
use crate::core::fragment::Reassembler;
use crate::core::pdu::{
    fault, AuthTrailer, BindAckPdu, BindNakPdu, BindNakReason, BindPdu, ContextElement,
    ContextResult, FaultPdu, PacketFlags, PacketType, Pdu, PduBody, PduHeader, ResponsePdu,
    MUST_RECV_FRAG_SIZE, RESPONSE_PREFIX_SIZE,
};
use crate::core::syntax::{DataRepresentation, NdrFormat, TransferSyntax};
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{self, Channel, PduReader};
use crate::protocol::dispatcher::{CallContext, DispatchTable, InterfaceRegistry};
use crate::protocol::presentation::{negotiate_element, Negotiated, PresentationContext};
use crate::security::{
    auth_type, AuthLevel, MechanismProvider, NegotiateProvider, Role, SecurityContext,
};
use crate::transport::BoxedStream;
use crate::utils::metrics::global_metrics;

/// State shared by every association a server accepts.
pub struct AssociationSettings {
    pub config: ServerConfig,
    pub registry: InterfaceRegistry,
    pub providers: Vec<Arc<dyn MechanismProvider>>,
    /// Port spec reported in bind acknowledgments.
    pub secondary_address: String,
    next_assoc_group: AtomicU32,
}

impl AssociationSettings {
    pub fn new(
        config: ServerConfig,
        registry: InterfaceRegistry,
        providers: Vec<Arc<dyn MechanismProvider>>,
        secondary_address: impl Into<String>,
    ) -> Self {
        Self {
            config,
            registry,
            providers,
            secondary_address: secondary_address.into(),
            next_assoc_group: AtomicU32::new(1),
        }
    }

    fn assign_group(&self, requested: u32) -> u32 {
        if requested != 0 {
            return requested;
        }
        loop {
            let id = self.next_assoc_group.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Acceptor-side provider for a requested authentication type.
    fn provider_for(&self, requested: u8) -> Option<Arc<dyn MechanismProvider>> {
        if requested == auth_type::NEGOTIATE {
            if self.providers.is_empty() {
                return None;
            }
            return Some(Arc::new(NegotiateProvider::new(self.providers.clone())));
        }
        self.providers
            .iter()
            .find(|p| p.auth_type() == requested)
            .cloned()
    }
}

impl std::fmt::Debug for AssociationSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationSettings")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("secondary_address", &self.secondary_address)
            .finish()
    }
}

/// An accepted presentation context and the table that serves it.
struct ServedContext {
    context: PresentationContext,
    table: Arc<DispatchTable>,
}

enum Flow {
    Continue,
    Close,
}

struct Association {
    settings: Arc<AssociationSettings>,
    channel: Arc<Channel>,
    peer: Arc<str>,
    bound: bool,
    contexts: HashMap<u16, ServedContext>,
    /// Security context still exchanging tokens; moved into the channel once established.
    negotiating: Option<SecurityContext>,
    reassembler: Reassembler,
    /// Faulted calls whose remaining fragments are still arriving.
    rejected: HashSet<u32>,
    limit: Arc<Semaphore>,
    calls: JoinSet<()>,
}

/// Serve one connection until the client leaves, a fatal error occurs or
/// `shutdown` flips to `true`.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn serve_association(
    stream: BoxedStream,
    peer: String,
    settings: Arc<AssociationSettings>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = &settings.config;
    let max_recv_frag = config.max_recv_frag.max(MUST_RECV_FRAG_SIZE);
    let max_xmit_frag = config.max_xmit_frag.max(MUST_RECV_FRAG_SIZE);
    let (mut reader, writer) = channel::split(stream, max_recv_frag, max_xmit_frag);

    let mut assoc = Association {
        channel: Arc::new(Channel::new(
            writer,
            DataRepresentation::LITTLE_ENDIAN,
            max_xmit_frag,
        )),
        peer: Arc::from(peer.as_str()),
        bound: false,
        contexts: HashMap::new(),
        negotiating: None,
        reassembler: Reassembler::new(config.max_call_size),
        rejected: HashSet::new(),
        limit: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1))),
        calls: JoinSet::new(),
        settings: Arc::clone(&settings),
    };
    global_metrics().connection_established();
    debug!("Association started");

    let result = assoc.run(&mut reader, &mut shutdown).await;

    // Let calls already dispatched deliver their responses.
    assoc.drain_calls().await;
    assoc.channel.clear_security();
    assoc.channel.close().await;
    global_metrics().connection_closed();

    match &result {
        Ok(()) => debug!("Association finished"),
        Err(e) => warn!(error = %e, "Association ended with an error"),
    }
    result
}

impl Association {
    async fn drain_calls(&mut self) {
        while let Some(joined) = self.calls.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Call task failed");
            }
        }
    }

    async fn run(
        &mut self,
        reader: &mut PduReader,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(in_flight = self.calls.len(), "Shutting down association");
                        self.drain_calls().await;
                        let notice = Pdu::new(0, self.channel.drep(), PduBody::Shutdown);
                        if let Err(e) = self.channel.send_pdu(notice).await {
                            debug!(error = %e, "Failed to send shutdown notice");
                        }
                        return Ok(());
                    }
                    continue;
                }
                Some(joined) = self.calls.join_next(), if !self.calls.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Call task failed");
                    }
                    continue;
                }
                frame = reader.next() => frame,
            };

            let mut frag = match frame {
                Some(Ok(frag)) => frag,
                Some(Err(e)) => {
                    global_metrics().protocol_error();
                    return Err(e);
                }
                None => return Ok(()),
            };
            global_metrics().fragment_received(frag.len() as u64);

            match self.handle_fragment(&mut frag).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn handle_fragment(&mut self, frag: &mut BytesMut) -> Result<Flow> {
        if let Err(e) = self.channel.unprotect(frag) {
            error!(error = %e, "Rejecting protected fragment");
            return Err(e);
        }
        let pdu = match Pdu::decode(frag) {
            Ok(pdu) => pdu,
            Err(e) => {
                global_metrics().protocol_error();
                let Ok(header) = PduHeader::parse(frag) else {
                    return Err(e);
                };
                warn!(call_id = header.call_id, error = %e, "Malformed PDU");
                let last = header.flags.contains(PacketFlags::LAST_FRAG);
                self.reject_call(header.call_id, 0, last, fault::NCA_S_PROTO_ERROR)
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        trace!(call_id = pdu.call_id, ptype = ?pdu.packet_type(), "Received PDU");

        match pdu.packet_type() {
            PacketType::Bind => self.on_bind(pdu).await,
            PacketType::AlterContext => self.on_alter_context(pdu).await,
            PacketType::Auth3 => self.on_auth3(pdu),
            PacketType::Request => self.on_request(pdu).await,
            PacketType::CoCancel | PacketType::Orphaned => {
                debug!(call_id = pdu.call_id, "Client abandoned call");
                self.reassembler.discard(pdu.call_id);
                self.rejected.remove(&pdu.call_id);
                Ok(Flow::Continue)
            }
            PacketType::Shutdown => Ok(Flow::Close),
            ptype => {
                global_metrics().protocol_error();
                warn!(?ptype, "Unexpected PDU from client");
                Err(ProtocolError::UnexpectedMessage)
            }
        }
    }

    async fn on_bind(&mut self, pdu: Pdu) -> Result<Flow> {
        let PduBody::Bind(bind) = pdu.body else {
            return Err(ProtocolError::UnexpectedMessage);
        };
        global_metrics().bind_attempt();
        if self.bound {
            warn!("Second bind on an association");
            self.send_nak(pdu.call_id, BindNakReason::NotSpecified).await?;
            return Ok(Flow::Continue);
        }
        self.channel.set_drep(pdu.drep);

        let mut token = None;
        if let Some(trailer) = pdu.auth.as_ref().filter(|t| t.auth_type != auth_type::NONE) {
            match self.accept_security(trailer) {
                Ok(out) => token = out,
                Err(reason) => {
                    global_metrics().auth_failure();
                    self.send_nak(pdu.call_id, reason).await?;
                    return Ok(Flow::Continue);
                }
            }
        }

        let settings = Arc::clone(&self.settings);
        let config = &settings.config;
        let max_xmit = config
            .max_xmit_frag
            .min(bind.max_recv_frag)
            .max(MUST_RECV_FRAG_SIZE);
        self.channel.set_max_xmit_frag(max_xmit);

        let results = self.negotiate(&bind)?;
        let assoc_group_id = settings.assign_group(bind.assoc_group_id);
        self.bound = true;
        debug!(
            assoc_group_id,
            max_xmit_frag = max_xmit,
            accepted = self.contexts.len(),
            "Bind accepted"
        );

        let mut ack = Pdu::new(
            pdu.call_id,
            pdu.drep,
            PduBody::BindAck(BindAckPdu {
                max_xmit_frag: max_xmit,
                max_recv_frag: config.max_recv_frag.max(MUST_RECV_FRAG_SIZE),
                assoc_group_id,
                secondary_address: settings.secondary_address.clone(),
                results,
            }),
        );
        if let Some(trailer) = token {
            ack = ack.with_auth(trailer);
        }
        self.channel.send_pdu(ack).await?;
        self.promote_security()?;
        Ok(Flow::Continue)
    }

    async fn on_alter_context(&mut self, pdu: Pdu) -> Result<Flow> {
        let PduBody::AlterContext(alter) = pdu.body else {
            return Err(ProtocolError::UnexpectedMessage);
        };
        if !self.bound {
            self.send_nak(pdu.call_id, BindNakReason::NotSpecified).await?;
            return Ok(Flow::Continue);
        }

        let mut token = None;
        if let Some(trailer) = pdu.auth.as_ref().filter(|t| t.auth_type != auth_type::NONE) {
            match self.continue_security(trailer) {
                Ok(out) => token = out,
                Err(e) => {
                    global_metrics().auth_failure();
                    warn!(error = %e, "Authentication leg failed");
                    self.send_fault(pdu.call_id, 0, fault::ACCESS_DENIED).await?;
                    return Ok(Flow::Close);
                }
            }
        }

        let results = self.negotiate(&alter)?;
        let mut response = Pdu::new(
            pdu.call_id,
            pdu.drep,
            PduBody::AlterContextResponse(BindAckPdu {
                max_xmit_frag: self.channel.max_xmit_frag(),
                max_recv_frag: self.settings.config.max_recv_frag.max(MUST_RECV_FRAG_SIZE),
                assoc_group_id: alter.assoc_group_id,
                secondary_address: String::new(),
                results,
            }),
        );
        if let Some(trailer) = token {
            response = response.with_auth(trailer);
        }
        self.channel.send_pdu(response).await?;
        self.promote_security()?;
        Ok(Flow::Continue)
    }

    fn on_auth3(&mut self, pdu: Pdu) -> Result<Flow> {
        let Some(trailer) = pdu.auth.as_ref() else {
            warn!("Auth3 without an authentication trailer");
            return Ok(Flow::Continue);
        };
        if let Err(e) = self.continue_security(trailer) {
            global_metrics().auth_failure();
            warn!(error = %e, "Final authentication leg failed");
            return Ok(Flow::Close);
        }
        self.promote_security()?;
        Ok(Flow::Continue)
    }

    async fn on_request(&mut self, pdu: Pdu) -> Result<Flow> {
        let call_id = pdu.call_id;
        let PduBody::Request(request) = &pdu.body else {
            return Err(ProtocolError::UnexpectedMessage);
        };
        let context_id = request.context_id;
        let first = pdu.flags.contains(PacketFlags::FIRST_FRAG);
        let last = pdu.flags.contains(PacketFlags::LAST_FRAG);

        if !first && self.rejected.contains(&call_id) {
            if last {
                self.rejected.remove(&call_id);
            }
            trace!(call_id, "Dropping fragment of a faulted call");
            return Ok(Flow::Continue);
        }
        // A first fragment starts over, even under a previously faulted id.
        self.rejected.remove(&call_id);

        let served = self
            .contexts
            .get(&context_id)
            .map(|served| (served.context.transfer_syntax(), Arc::clone(&served.table)));
        let Some((syntax, table)) = served else {
            warn!(call_id, context_id, "Request on an unknown presentation context");
            self.reject_call(call_id, context_id, last, fault::NCA_S_UNK_IF)
                .await?;
            return Ok(Flow::Continue);
        };
        let (level, mechanism) = self.channel.security_info();
        if self.negotiating.is_some() || level < self.settings.config.min_auth_level {
            warn!(call_id, ?level, "Request below the required authentication level");
            self.reject_call(call_id, context_id, last, fault::ACCESS_DENIED)
                .await?;
            return Ok(Flow::Continue);
        }
        let Some(syntax) = syntax else {
            self.reject_call(call_id, context_id, last, fault::NCA_S_UNK_IF)
                .await?;
            return Ok(Flow::Continue);
        };

        let whole = match self.reassembler.push(pdu) {
            Ok(Some(whole)) => whole,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                global_metrics().protocol_error();
                warn!(call_id, error = %e, "Request reassembly failed");
                self.reject_call(call_id, context_id, last, fault::NCA_S_PROTO_ERROR)
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let PduBody::Request(request) = whole.body else {
            return Err(ProtocolError::UnexpectedMessage);
        };

        let ctx = CallContext {
            call_id,
            context_id,
            opnum: request.opnum,
            object: request.object,
            format: NdrFormat::new(syntax, whole.drep),
            peer: Arc::clone(&self.peer),
            auth_level: level,
            mechanism,
        };
        self.spawn_call(table, request.stub, ctx).await;
        Ok(Flow::Continue)
    }

    /// Run one call on its own task once a concurrency slot is free.
    async fn spawn_call(&mut self, table: Arc<DispatchTable>, stub: Bytes, ctx: CallContext) {
        let permit = match Arc::clone(&self.limit).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        global_metrics().call_started();
        let channel = Arc::clone(&self.channel);

        self.calls.spawn(async move {
            let _permit = permit;
            let (call_id, context_id, opnum) = (ctx.call_id, ctx.context_id, ctx.opnum);
            trace!(call_id, opnum, interface = %table.name(), "Dispatching call");

            let sent = match table.dispatch(stub, ctx).await {
                Ok(response) => {
                    channel
                        .send_stub(
                            call_id,
                            Bytes::from(response),
                            RESPONSE_PREFIX_SIZE,
                            |alloc_hint, chunk| {
                                PduBody::Response(ResponsePdu {
                                    alloc_hint,
                                    context_id,
                                    cancel_count: 0,
                                    stub: chunk,
                                })
                            },
                        )
                        .await
                }
                Err(e) => {
                    global_metrics().fault();
                    debug!(call_id, opnum, status = e.status, message = %e.message, "Call faulted");
                    channel
                        .send_pdu(fault_pdu(call_id, channel.drep(), context_id, e.status))
                        .await
                }
            };
            if let Err(e) = sent {
                warn!(call_id, error = %e, "Failed to send call result");
            }
        });
    }

    /// Answer each offered context; records the accepted ones.
    fn negotiate(&mut self, bind: &BindPdu) -> Result<Vec<ContextResult>> {
        let settings = Arc::clone(&self.settings);
        let supported: &[TransferSyntax] = &settings.config.transfer_syntaxes;
        let mut results = Vec::with_capacity(bind.contexts.len());
        for element in &bind.contexts {
            let table = settings.registry.lookup(&element.abstract_syntax)?;
            let (result, chosen) = negotiate_element(element, table.is_some(), supported);
            if let (Some(table), Some(syntax)) = (table, chosen) {
                self.accept_context(element, table, syntax);
            } else {
                debug!(
                    context_id = element.context_id,
                    interface = %element.abstract_syntax,
                    reason = ?result.reason,
                    "Context rejected"
                );
            }
            results.push(result);
        }
        Ok(results)
    }

    fn accept_context(&mut self, element: &ContextElement, table: Arc<DispatchTable>, syntax: TransferSyntax) {
        // An id keeps the meaning it was first given.
        self.contexts
            .entry(element.context_id)
            .or_insert_with(|| ServedContext {
                context: PresentationContext {
                    id: element.context_id,
                    abstract_syntax: element.abstract_syntax,
                    outcome: Negotiated::Accepted(syntax),
                },
                table,
            });
    }

    /// Start the acceptor side from the client's first token.
    fn accept_security(
        &mut self,
        trailer: &AuthTrailer,
    ) -> std::result::Result<Option<AuthTrailer>, BindNakReason> {
        let provider = self.settings.provider_for(trailer.auth_type).ok_or_else(|| {
            warn!(auth_type = trailer.auth_type, "Unsupported authentication type");
            BindNakReason::AuthenticationTypeNotRecognized
        })?;
        let level = AuthLevel::try_from(trailer.auth_level).map_err(|_| {
            warn!(auth_level = trailer.auth_level, "Unknown authentication level");
            BindNakReason::AuthenticationTypeNotRecognized
        })?;

        let mut ctx = SecurityContext::new(
            provider.create(Role::Acceptor),
            level,
            trailer.context_id,
            self.peer.as_ref(),
            "",
        );
        let step = ctx.initialize(Some(trailer.verifier.as_ref())).map_err(|e| {
            warn!(error = %e, "Rejecting client token");
            BindNakReason::InvalidChecksum
        })?;
        let out = step.token.map(|t| ctx.token_trailer(t));
        self.negotiating = Some(ctx);
        Ok(out)
    }

    /// Feed a later client token to the context still negotiating.
    fn continue_security(&mut self, trailer: &AuthTrailer) -> Result<Option<AuthTrailer>> {
        let ctx = self.negotiating.as_mut().ok_or_else(|| {
            ProtocolError::AuthError("no authentication exchange in progress".into())
        })?;
        let step = match ctx.initialize(Some(trailer.verifier.as_ref())) {
            Ok(step) => step,
            Err(e) => {
                self.negotiating = None;
                return Err(e);
            }
        };
        Ok(step.token.map(|t| ctx.token_trailer(t)))
    }

    /// Hand an established context to the channel.
    fn promote_security(&mut self) -> Result<()> {
        if !self.negotiating.as_ref().is_some_and(|c| c.is_established()) {
            return Ok(());
        }
        if let Some(ctx) = self.negotiating.take() {
            info!(
                mechanism = ctx.mechanism_name(),
                level = ?ctx.level(),
                "Client authenticated"
            );
            self.channel.install_security(ctx)?;
        }
        Ok(())
    }

    async fn send_nak(&self, call_id: u32, reason: BindNakReason) -> Result<()> {
        global_metrics().bind_rejected();
        let nak = Pdu::new(
            call_id,
            self.channel.drep(),
            PduBody::BindNak(BindNakPdu {
                reason,
                versions: vec![(5, 0)],
            }),
        );
        self.channel.send_pdu(nak).await
    }

    /// Fault a call once; its later fragments are dropped up to the last one.
    async fn reject_call(
        &mut self,
        call_id: u32,
        context_id: u16,
        last: bool,
        status: u32,
    ) -> Result<()> {
        self.reassembler.discard(call_id);
        let already_faulted = if last {
            self.rejected.remove(&call_id)
        } else {
            !self.rejected.insert(call_id)
        };
        if already_faulted {
            return Ok(());
        }
        self.send_fault(call_id, context_id, status).await
    }

    async fn send_fault(&self, call_id: u32, context_id: u16, status: u32) -> Result<()> {
        global_metrics().fault();
        self.channel
            .send_pdu(fault_pdu(call_id, self.channel.drep(), context_id, status))
            .await
    }
}

fn fault_pdu(call_id: u32, drep: DataRepresentation, context_id: u16, status: u32) -> Pdu {
    Pdu::new(
        call_id,
        drep,
        PduBody::Fault(FaultPdu {
            alloc_hint: 0,
            context_id,
            cancel_count: 0,
            flags: 0,
            status,
        }),
    )
}
