//! Presentation contexts: interface plus transfer syntax, negotiated per id.
//!
//! The client builds [`ContextRequest`]s into bind and alter-context PDUs and
//! folds the acknowledgment back into a [`PresentationContext`] per id. The
//! server side picks a transfer syntax with [`select_transfer_syntax`]: the
//! first syntax in the client's offered order that the server supports.

use std::collections::BTreeMap;

use crate::core::pdu::{ContextElement, ContextOutcome, ContextResult, ProviderReason};
use crate::core::syntax::{DataRepresentation, NdrFormat, SyntaxId, TransferSyntax, Uuid};
use crate::error::{constants, ProtocolError, Result};

/// One presentation context the client wants negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    pub abstract_syntax: SyntaxId,
    /// Candidate syntaxes, most preferred first.
    pub transfer_syntaxes: Vec<TransferSyntax>,
}

impl ContextRequest {
    pub fn new(abstract_syntax: SyntaxId, transfer_syntaxes: Vec<TransferSyntax>) -> Self {
        Self {
            abstract_syntax,
            transfer_syntaxes,
        }
    }

    pub fn ndr20(abstract_syntax: SyntaxId) -> Self {
        Self::new(abstract_syntax, vec![TransferSyntax::Ndr20])
    }

    pub(crate) fn to_element(&self, context_id: u16) -> ContextElement {
        ContextElement {
            context_id,
            abstract_syntax: self.abstract_syntax,
            transfer_syntaxes: self
                .transfer_syntaxes
                .iter()
                .map(|s| s.syntax_id())
                .collect(),
        }
    }
}

/// Result of negotiating one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated {
    Accepted(TransferSyntax),
    Rejected(ProviderReason),
}

/// A negotiated presentation context; immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u16,
    pub abstract_syntax: SyntaxId,
    pub outcome: Negotiated,
}

impl PresentationContext {
    /// Fold one bind-ack result into a context. Acceptance of a syntax the
    /// client never offered is a protocol violation.
    pub fn from_result(
        request: &ContextRequest,
        id: u16,
        result: &ContextResult,
    ) -> Result<Self> {
        let outcome = match result.outcome {
            ContextOutcome::Accepted => {
                let chosen = TransferSyntax::from_syntax_id(&result.transfer_syntax)
                    .filter(|s| request.transfer_syntaxes.contains(s))
                    .ok_or_else(|| {
                        ProtocolError::NegotiationError(format!(
                            "server accepted context {id} with unoffered syntax {}",
                            result.transfer_syntax
                        ))
                    })?;
                Negotiated::Accepted(chosen)
            }
            _ => Negotiated::Rejected(result.reason),
        };
        Ok(Self {
            id,
            abstract_syntax: request.abstract_syntax,
            outcome,
        })
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, Negotiated::Accepted(_))
    }

    pub fn transfer_syntax(&self) -> Option<TransferSyntax> {
        match self.outcome {
            Negotiated::Accepted(s) => Some(s),
            Negotiated::Rejected(_) => None,
        }
    }

    /// Codec settings for stubs on this context.
    pub fn format(&self, drep: DataRepresentation) -> Result<NdrFormat> {
        let syntax = self.transfer_syntax().ok_or_else(|| {
            ProtocolError::NegotiationError(constants::ERR_UNKNOWN_CONTEXT.into())
        })?;
        Ok(NdrFormat::new(syntax, drep))
    }
}

/// First syntax in `offered` order that appears in `supported`.
pub fn select_transfer_syntax(
    offered: &[SyntaxId],
    supported: &[TransferSyntax],
) -> Option<TransferSyntax> {
    offered
        .iter()
        .filter_map(TransferSyntax::from_syntax_id)
        .find(|s| supported.contains(s))
}

/// Server-side answer for one offered context element.
pub fn negotiate_element(
    element: &ContextElement,
    interface_known: bool,
    supported: &[TransferSyntax],
) -> (ContextResult, Option<TransferSyntax>) {
    if !interface_known {
        return (rejection(ProviderReason::AbstractSyntaxNotSupported), None);
    }
    match select_transfer_syntax(&element.transfer_syntaxes, supported) {
        Some(syntax) => (
            ContextResult {
                outcome: ContextOutcome::Accepted,
                reason: ProviderReason::NotSpecified,
                transfer_syntax: syntax.syntax_id(),
            },
            Some(syntax),
        ),
        None => (rejection(ProviderReason::TransferSyntaxesNotSupported), None),
    }
}

fn rejection(reason: ProviderReason) -> ContextResult {
    ContextResult {
        outcome: ContextOutcome::ProviderRejected,
        reason,
        transfer_syntax: SyntaxId::new(Uuid::NIL, 0, 0),
    }
}

/// Accepted contexts of one association, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ContextSet {
    contexts: BTreeMap<u16, PresentationContext>,
}

impl ContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context. Ids are never reused, so an existing entry is kept.
    pub fn insert(&mut self, ctx: PresentationContext) -> bool {
        if self.contexts.contains_key(&ctx.id) {
            return false;
        }
        self.contexts.insert(ctx.id, ctx);
        true
    }

    pub fn get(&self, id: u16) -> Option<&PresentationContext> {
        self.contexts.get(&id)
    }

    /// Accepted context for `id`, or a negotiation error.
    pub fn accepted(&self, id: u16) -> Result<&PresentationContext> {
        self.contexts
            .get(&id)
            .filter(|c| c.is_accepted())
            .ok_or_else(|| ProtocolError::NegotiationError(constants::ERR_UNKNOWN_CONTEXT.into()))
    }

    /// First accepted context for an interface.
    pub fn find_interface(&self, abstract_syntax: &SyntaxId) -> Option<&PresentationContext> {
        self.contexts
            .values()
            .find(|c| c.is_accepted() && c.abstract_syntax == *abstract_syntax)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PresentationContext> {
        self.contexts.values()
    }

    pub fn accepted_count(&self) -> usize {
        self.contexts.values().filter(|c| c.is_accepted()).count()
    }

    pub fn next_id(&self) -> u16 {
        self.contexts
            .keys()
            .next_back()
            .map_or(0, |last| last.wrapping_add(1))
    }
}
