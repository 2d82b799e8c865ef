//! Negotiate meta-mechanism.
//!
//! The initiator lists the mechanisms it is willing to use, most preferred
//! first, and optimistically includes the first token of its preferred one.
//! The acceptor adopts the first listed mechanism it also supports. If that is
//! not the optimistic choice, the initiator restarts with the chosen mechanism
//! over a continuation token. Once chosen, the mechanism is fixed.
//!
//! ```text
//! init:         [0x01] [count(1)] [auth_type(1) * count] [len(4)] [token]
//! response:     [0x02] [chosen(1)] [established(1)] [len(4)] [token]
//! continuation: [0x03] [len(4)] [token]
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::security::{
    auth_type, Mechanism, MechanismProvider, Role, Step, StepContext, StepStatus,
};

const TOKEN_INIT: u8 = 0x01;
const TOKEN_RESPONSE: u8 = 0x02;
const TOKEN_CONTINUE: u8 = 0x03;

fn put_inner(out: &mut Vec<u8>, token: Option<&[u8]>) -> Result<()> {
    let token = token.unwrap_or_default();
    let len = u32::try_from(token.len())
        .map_err(|_| ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(token);
    Ok(())
}

fn take_inner(input: &[u8]) -> Result<&[u8]> {
    let malformed = || ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into());
    let len_bytes: [u8; 4] = input
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(malformed)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let body = &input[4..];
    if body.len() != len {
        return Err(malformed());
    }
    Ok(body)
}

fn continuation(token: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
    let Some(token) = token else {
        return Ok(None);
    };
    let mut out = Vec::with_capacity(5 + token.len());
    out.push(TOKEN_CONTINUE);
    put_inner(&mut out, Some(token))?;
    Ok(Some(out))
}

/// Negotiating wrapper for one connection.
pub struct NegotiateMechanism {
    role: Role,
    providers: Arc<Vec<Arc<dyn MechanismProvider>>>,
    inner: Option<Box<dyn Mechanism>>,
    /// Set once the acceptor's choice is known.
    chosen: bool,
    failed: bool,
}

impl NegotiateMechanism {
    pub fn new(role: Role, providers: Arc<Vec<Arc<dyn MechanismProvider>>>) -> Self {
        Self {
            role,
            providers,
            inner: None,
            chosen: false,
            failed: false,
        }
    }

    /// Name of the adopted mechanism, once there is one.
    pub fn selected(&self) -> Option<&'static str> {
        self.inner.as_ref().map(|m| m.name())
    }

    fn provider(&self, id: u8) -> Option<&Arc<dyn MechanismProvider>> {
        self.providers.iter().find(|p| p.auth_type() == id)
    }

    fn inner(&mut self) -> Result<&mut Box<dyn Mechanism>> {
        self.inner
            .as_mut()
            .ok_or_else(|| ProtocolError::AuthError(constants::ERR_NOT_ESTABLISHED.into()))
    }

    fn initiator_start(&mut self, ctx: &StepContext<'_>) -> Result<Step> {
        let first = self
            .providers
            .first()
            .ok_or_else(|| ProtocolError::AuthError(constants::ERR_NO_COMMON_MECHANISM.into()))?;
        let mut mech = first.create(Role::Initiator);
        let optimistic = mech.step(ctx, None);
        if let StepStatus::Failed(reason) = optimistic.status {
            return Err(ProtocolError::AuthError(reason));
        }

        // The offer list has a one-byte count.
        let count = u8::try_from(self.providers.len())
            .map_err(|_| ProtocolError::AuthError(constants::ERR_TOO_MANY_MECHANISMS.into()))?;
        let mut out = vec![TOKEN_INIT, count];
        out.extend(self.providers.iter().map(|p| p.auth_type()));
        put_inner(&mut out, optimistic.token.as_deref())?;
        self.inner = Some(mech);
        Ok(Step::proceed(out))
    }

    fn initiator_response(&mut self, ctx: &StepContext<'_>, input: &[u8]) -> Result<Step> {
        if input.len() < 3 || input[0] != TOKEN_RESPONSE {
            return Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()));
        }
        let chosen = input[1];
        let acceptor_done = input[2] != 0;
        let token = take_inner(&input[3..])?;
        self.chosen = true;

        let optimistic = self.inner.as_ref().map(|m| m.auth_type());
        if optimistic != Some(chosen) {
            let provider = self.provider(chosen).ok_or_else(|| {
                ProtocolError::AuthError(constants::ERR_NO_COMMON_MECHANISM.into())
            })?;
            debug!(mechanism = provider.name(), "Acceptor chose another mechanism, restarting");
            let mut mech = provider.create(Role::Initiator);
            let step = mech.step(ctx, None);
            self.inner = Some(mech);
            return self.wrap(step);
        }

        let step = if token.is_empty() {
            Step {
                token: None,
                status: if acceptor_done && self.inner()?.is_established() {
                    StepStatus::Established
                } else {
                    StepStatus::Continue
                },
            }
        } else {
            self.inner()?.step(ctx, Some(token))
        };
        self.wrap(step)
    }

    fn acceptor_start(&mut self, ctx: &StepContext<'_>, input: &[u8]) -> Result<Step> {
        if input.len() < 2 || input[0] != TOKEN_INIT {
            return Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()));
        }
        let count = input[1] as usize;
        let offered = input
            .get(2..2 + count)
            .ok_or_else(|| ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()))?;
        let optimistic = take_inner(&input[2 + count..])?;

        let (position, provider) = offered
            .iter()
            .enumerate()
            .find_map(|(i, id)| self.provider(*id).map(|p| (i, Arc::clone(p))))
            .ok_or_else(|| ProtocolError::AuthError(constants::ERR_NO_COMMON_MECHANISM.into()))?;
        debug!(mechanism = provider.name(), "Negotiated mechanism");

        let mut mech = provider.create(Role::Acceptor);
        let step = if position == 0 && !optimistic.is_empty() {
            mech.step(ctx, Some(optimistic))
        } else {
            Step {
                token: None,
                status: StepStatus::Continue,
            }
        };
        self.inner = Some(mech);
        self.chosen = true;

        if let StepStatus::Failed(reason) = step.status {
            return Err(ProtocolError::AuthError(reason));
        }
        let established = step.status == StepStatus::Established;
        let mut out = vec![TOKEN_RESPONSE, provider.auth_type(), u8::from(established)];
        put_inner(&mut out, step.token.as_deref())?;
        Ok(Step {
            token: Some(out),
            status: step.status,
        })
    }

    fn continue_inner(&mut self, ctx: &StepContext<'_>, input: &[u8]) -> Result<Step> {
        if input.first() != Some(&TOKEN_CONTINUE) {
            return Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()));
        }
        let token = take_inner(&input[1..])?;
        let step = self.inner()?.step(ctx, Some(token));
        self.wrap(step)
    }

    /// Re-wrap an inner step's token as a continuation token.
    fn wrap(&self, step: Step) -> Result<Step> {
        match step.status {
            StepStatus::Failed(reason) => Err(ProtocolError::AuthError(reason)),
            status => Ok(Step {
                token: continuation(step.token.as_deref())?,
                status,
            }),
        }
    }
}

impl Mechanism for NegotiateMechanism {
    fn name(&self) -> &'static str {
        "negotiate"
    }

    fn auth_type(&self) -> u8 {
        auth_type::NEGOTIATE
    }

    fn step(&mut self, ctx: &StepContext<'_>, input: Option<&[u8]>) -> Step {
        if self.failed {
            return Step::failed(constants::ERR_MALFORMED_TOKEN);
        }
        let result = match (self.role, self.inner.is_some(), self.chosen, input) {
            (Role::Initiator, false, _, _) => self.initiator_start(ctx),
            (Role::Initiator, true, false, Some(input)) => self.initiator_response(ctx, input),
            (Role::Acceptor, false, _, Some(input)) => self.acceptor_start(ctx, input),
            (_, true, true, Some(input)) => self.continue_inner(ctx, input),
            _ => Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into())),
        };
        match result {
            Ok(step) => step,
            Err(e) => {
                warn!(error = %e, "Mechanism negotiation failed");
                self.failed = true;
                Step::failed(e.to_string())
            }
        }
    }

    fn is_established(&self) -> bool {
        self.inner.as_ref().is_some_and(|m| m.is_established())
    }

    fn signature_len(&self) -> usize {
        self.inner.as_ref().map_or(0, |m| m.signature_len())
    }

    fn sign(&mut self, seq: u32, message: &[u8]) -> Result<Vec<u8>> {
        self.inner()?.sign(seq, message)
    }

    fn verify(&mut self, seq: u32, message: &[u8], signature: &[u8]) -> bool {
        match self.inner.as_mut() {
            Some(inner) => inner.verify(seq, message, signature),
            None => false,
        }
    }

    fn seal(&mut self, seq: u32, aad: &[u8], data: &mut [u8]) -> Result<Vec<u8>> {
        self.inner()?.seal(seq, aad, data)
    }

    fn unseal(&mut self, seq: u32, aad: &[u8], data: &mut [u8], tag: &[u8]) -> Result<()> {
        self.inner()?.unseal(seq, aad, data, tag)
    }
}

/// Creates [`NegotiateMechanism`]s over an ordered provider list.
#[derive(Clone)]
pub struct NegotiateProvider {
    providers: Arc<Vec<Arc<dyn MechanismProvider>>>,
}

impl NegotiateProvider {
    /// `providers` is in preference order; the initiator offers them in this order.
    pub fn new(providers: Vec<Arc<dyn MechanismProvider>>) -> Self {
        Self {
            providers: Arc::new(providers),
        }
    }

    pub fn providers(&self) -> &[Arc<dyn MechanismProvider>] {
        &self.providers
    }
}

impl MechanismProvider for NegotiateProvider {
    fn name(&self) -> &'static str {
        "negotiate"
    }

    fn auth_type(&self) -> u8 {
        auth_type::NEGOTIATE
    }

    fn create(&self, role: Role) -> Box<dyn Mechanism> {
        Box::new(NegotiateMechanism::new(role, Arc::clone(&self.providers)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::security::ecdh::EcdhProvider;

    const CTX: StepContext<'static> = StepContext {
        peer_identity: "peer",
        target_name: "host/server",
    };

    /// Accepts any token and establishes on the first acceptor step.
    struct NullProvider(u8);

    struct NullMechanism {
        id: u8,
        role: Role,
        done: bool,
    }

    impl Mechanism for NullMechanism {
        fn name(&self) -> &'static str {
            "null"
        }
        fn auth_type(&self) -> u8 {
            self.id
        }
        fn step(&mut self, _ctx: &StepContext<'_>, input: Option<&[u8]>) -> Step {
            match (self.role, input) {
                (Role::Initiator, None) => Step::proceed(vec![self.id]),
                (Role::Acceptor, Some(_)) => {
                    self.done = true;
                    Step::established(Some(vec![0xAC]))
                }
                (Role::Initiator, Some(_)) => {
                    self.done = true;
                    Step::established(None)
                }
                _ => Step::failed("unexpected"),
            }
        }
        fn is_established(&self) -> bool {
            self.done
        }
        fn signature_len(&self) -> usize {
            0
        }
        fn sign(&mut self, _seq: u32, _message: &[u8]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn verify(&mut self, _seq: u32, _message: &[u8], _signature: &[u8]) -> bool {
            true
        }
        fn seal(&mut self, _seq: u32, _aad: &[u8], _data: &mut [u8]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn unseal(&mut self, _seq: u32, _aad: &[u8], _data: &mut [u8], _tag: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    impl MechanismProvider for NullProvider {
        fn name(&self) -> &'static str {
            "null"
        }
        fn auth_type(&self) -> u8 {
            self.0
        }
        fn create(&self, role: Role) -> Box<dyn Mechanism> {
            Box::new(NullMechanism {
                id: self.0,
                role,
                done: false,
            })
        }
    }

    fn run(client: &mut dyn Mechanism, server: &mut dyn Mechanism) -> usize {
        let mut legs = 0;
        let mut token = client.step(&CTX, None).token;
        loop {
            let Some(t) = token.take() else { break };
            legs += 1;
            let reply = server.step(&CTX, Some(&t));
            assert!(!matches!(reply.status, StepStatus::Failed(_)), "{reply:?}");
            let Some(r) = reply.token else { break };
            legs += 1;
            let next = client.step(&CTX, Some(&r));
            assert!(!matches!(next.status, StepStatus::Failed(_)), "{next:?}");
            token = next.token;
        }
        legs
    }

    #[test]
    fn test_optimistic_choice() {
        let ecdh: Arc<dyn MechanismProvider> = Arc::new(EcdhProvider::new());
        let client = NegotiateProvider::new(vec![Arc::clone(&ecdh)]);
        let server = NegotiateProvider::new(vec![ecdh]);
        let mut c = client.create(Role::Initiator);
        let mut s = server.create(Role::Acceptor);

        let legs = run(c.as_mut(), s.as_mut());
        assert_eq!(legs, 3);
        assert!(c.is_established());
        assert!(s.is_established());

        let sig = c.sign(0, b"msg").unwrap();
        assert!(s.verify(0, b"msg", &sig));
    }

    #[test]
    fn test_fallback_to_second_preference() {
        let ecdh: Arc<dyn MechanismProvider> = Arc::new(EcdhProvider::new());
        let client = NegotiateProvider::new(vec![Arc::new(NullProvider(0x91)), Arc::clone(&ecdh)]);
        let server = NegotiateProvider::new(vec![ecdh]);
        let mut c = client.create(Role::Initiator);
        let mut s = server.create(Role::Acceptor);

        // init, empty choice, restarted init, response, confirm
        let legs = run(c.as_mut(), s.as_mut());
        assert_eq!(legs, 5);
        assert!(c.is_established());
        assert!(s.is_established());
        assert_eq!(c.signature_len(), 16);
    }

    #[test]
    fn test_acceptor_prefers_client_order() {
        let client = NegotiateProvider::new(vec![
            Arc::new(NullProvider(0x92)),
            Arc::new(NullProvider(0x93)),
        ]);
        let server = NegotiateProvider::new(vec![
            Arc::new(NullProvider(0x93)),
            Arc::new(NullProvider(0x92)),
        ]);
        let mut c = client.create(Role::Initiator);
        let mut s = server.create(Role::Acceptor);

        let init = c.step(&CTX, None).token.unwrap();
        let reply = s.step(&CTX, Some(&init)).token.unwrap();
        assert_eq!(reply[1], 0x92);
    }

    #[test]
    fn test_offer_list_limited_to_one_byte_count() {
        let providers: Vec<Arc<dyn MechanismProvider>> = (0..256)
            .map(|i| Arc::new(NullProvider(i as u8)) as Arc<dyn MechanismProvider>)
            .collect();
        let mut c = NegotiateProvider::new(providers).create(Role::Initiator);
        match c.step(&CTX, None).status {
            StepStatus::Failed(reason) => assert_eq!(
                reason,
                ProtocolError::AuthError(constants::ERR_TOO_MANY_MECHANISMS.into()).to_string()
            ),
            other => panic!("unexpected status {other:?}"),
        }

        let providers: Vec<Arc<dyn MechanismProvider>> = (0..255)
            .map(|i| Arc::new(NullProvider(i as u8)) as Arc<dyn MechanismProvider>)
            .collect();
        let mut c = NegotiateProvider::new(providers).create(Role::Initiator);
        let init = c.step(&CTX, None).token.unwrap();
        assert_eq!(init[1], 255);
    }

    #[test]
    fn test_no_common_mechanism() {
        let client = NegotiateProvider::new(vec![Arc::new(NullProvider(0x94))]);
        let server = NegotiateProvider::new(vec![Arc::new(NullProvider(0x95))]);
        let mut c = client.create(Role::Initiator);
        let mut s = server.create(Role::Acceptor);

        let init = c.step(&CTX, None).token.unwrap();
        match s.step(&CTX, Some(&init)).status {
            StepStatus::Failed(reason) => assert!(reason.contains("No mutually supported")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_token_fails() {
        let server = NegotiateProvider::new(vec![Arc::new(NullProvider(0x96))]);
        let mut s = server.create(Role::Acceptor);
        assert!(matches!(
            s.step(&CTX, Some(&[TOKEN_INIT, 4, 0x96])).status,
            StepStatus::Failed(_)
        ));
    }
}
