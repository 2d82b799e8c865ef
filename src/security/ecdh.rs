//! Ephemeral x25519 key agreement mechanism.
//!
//! A three-leg exchange with timestamped nonces, carried in the bind,
//! bind-ack and auth3 authentication trailers:
//!
//! ```text
//! initiator -> [0x01] [public(32)] [timestamp_ms(8)] [nonce(16)]
//! acceptor  -> [0x02] [public(32)] [nonce(16)] [sha256(initiator nonce)(32)]
//! initiator -> [0x03] [sha256(acceptor nonce)(32)]
//! ```
//!
//! Both sides derive a session key from the shared secret and both nonces,
//! then expand one ChaCha20-Poly1305 key per direction with HKDF. The PDU
//! sequence number is the AEAD nonce, so a signature or seal only verifies at
//! the sequence it was produced for.
//!
//! Handshake state lives in the mechanism instance, one per connection;
//! nothing is shared between connections except the provider's replay cache.

use crate::error::{constants, ProtocolError, Result};
use crate::security::{auth_type, Mechanism, MechanismProvider, Role, Step, StepContext};
use crate::utils::replay_cache::ReplayCache;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::Zeroize;

use tracing::{debug, warn};

const TOKEN_INIT: u8 = 0x01;
const TOKEN_RESPONSE: u8 = 0x02;
const TOKEN_CONFIRM: u8 = 0x03;

const INIT_LEN: usize = 1 + 32 + 8 + 16;
const RESPONSE_LEN: usize = 1 + 32 + 16 + 32;
const CONFIRM_LEN: usize = 1 + 32;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Maximum age of an initiator timestamp.
pub const MAX_TOKEN_AGE_SECS: u64 = 30;

const INFO_INITIATOR_TO_ACCEPTOR: &[u8] = b"dcerpc c2s";
const INFO_ACCEPTOR_TO_INITIATOR: &[u8] = b"dcerpc s2c";

/// Get the current timestamp in milliseconds
fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::AuthError(constants::ERR_SYSTEM_TIME.into()))
}

/// Generate a cryptographically secure random nonce
fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Verify that a timestamp is recent enough
/// Allows a strict 2-second future tolerance for clock skew
pub fn verify_timestamp(timestamp: u64, max_age_seconds: u64) -> bool {
    let current = match current_timestamp() {
        Ok(time) => time,
        Err(_) => return false,
    };

    let max_age_ms = max_age_seconds * 1000;
    const FUTURE_TOLERANCE_MS: u64 = 2000;

    if timestamp > current + FUTURE_TOLERANCE_MS {
        return false;
    }

    if current > timestamp && current - timestamp > max_age_ms {
        return false;
    }

    true
}

fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Session key from the shared secret and both nonces (order matters).
fn derive_session_key(
    shared_secret: &SharedSecret,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    hasher.update(b"client_nonce");
    hasher.update(client_nonce);
    hasher.update(b"server_nonce");
    hasher.update(server_nonce);
    hasher.finalize().into()
}

/// Per-direction keys, zeroed on drop.
struct DirectionalKeys {
    send: [u8; 32],
    recv: [u8; 32],
}

impl DirectionalKeys {
    fn expand(session_key: &[u8; 32], role: Role) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, session_key);
        let mut c2s = [0u8; 32];
        let mut s2c = [0u8; 32];
        hk.expand(INFO_INITIATOR_TO_ACCEPTOR, &mut c2s)
            .and_then(|_| hk.expand(INFO_ACCEPTOR_TO_INITIATOR, &mut s2c))
            .map_err(|_| ProtocolError::AuthError("key expansion failed".into()))?;
        let keys = match role {
            Role::Initiator => Self { send: c2s, recv: s2c },
            Role::Acceptor => Self { send: s2c, recv: c2s },
        };
        c2s.zeroize();
        s2c.zeroize();
        Ok(keys)
    }
}

impl Drop for DirectionalKeys {
    fn drop(&mut self) {
        self.send.zeroize();
        self.recv.zeroize();
    }
}

fn aead_nonce(seq: u32) -> Nonce {
    let mut raw = [0u8; 12];
    raw[..4].copy_from_slice(&seq.to_le_bytes());
    *Nonce::from_slice(&raw)
}

enum HandshakeState {
    Start,
    /// Initiator sent its public key and nonce.
    AwaitResponse {
        secret: EphemeralSecret,
        client_nonce: [u8; 16],
    },
    /// Acceptor answered and waits for proof the initiator saw its nonce.
    AwaitConfirm {
        secret: EphemeralSecret,
        client_public: [u8; 32],
        client_nonce: [u8; 16],
        server_nonce: [u8; 16],
    },
    Established(DirectionalKeys),
    Failed,
}

#[derive(Clone, Copy)]
enum Phase {
    Start,
    AwaitResponse,
    AwaitConfirm,
    Done,
}

/// x25519 mechanism for one connection.
pub struct EcdhMechanism {
    role: Role,
    state: HandshakeState,
    replay_cache: Arc<Mutex<ReplayCache>>,
}

impl EcdhMechanism {
    pub fn new(role: Role, replay_cache: Arc<Mutex<ReplayCache>>) -> Self {
        Self {
            role,
            state: HandshakeState::Start,
            replay_cache,
        }
    }

    fn is_replay(&self, peer_id: &str, nonce: &[u8; 16], timestamp: u64) -> bool {
        match self.replay_cache.lock() {
            Ok(mut cache) => cache.is_replay(peer_id, nonce, timestamp),
            // A poisoned cache cannot vouch for anything.
            Err(_) => true,
        }
    }

    fn phase(&self) -> Phase {
        match self.state {
            HandshakeState::Start => Phase::Start,
            HandshakeState::AwaitResponse { .. } => Phase::AwaitResponse,
            HandshakeState::AwaitConfirm { .. } => Phase::AwaitConfirm,
            HandshakeState::Established(_) | HandshakeState::Failed => Phase::Done,
        }
    }

    fn keys(&self) -> Result<&DirectionalKeys> {
        match &self.state {
            HandshakeState::Established(keys) => Ok(keys),
            _ => Err(ProtocolError::AuthError(constants::ERR_NOT_ESTABLISHED.into())),
        }
    }

    fn initiator_start(&mut self) -> Result<Vec<u8>> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let nonce = generate_nonce();
        let timestamp = current_timestamp()?;

        let mut token = Vec::with_capacity(INIT_LEN);
        token.push(TOKEN_INIT);
        token.extend_from_slice(public.as_bytes());
        token.extend_from_slice(&timestamp.to_le_bytes());
        token.extend_from_slice(&nonce);

        self.state = HandshakeState::AwaitResponse {
            secret,
            client_nonce: nonce,
        };
        debug!("Initiator starting key agreement");
        Ok(token)
    }

    fn acceptor_respond(&mut self, ctx: &StepContext<'_>, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() != INIT_LEN || input[0] != TOKEN_INIT {
            return Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()));
        }
        let mut client_public = [0u8; 32];
        client_public.copy_from_slice(&input[1..33]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&input[33..41]);
        let timestamp = u64::from_le_bytes(ts);
        let mut client_nonce = [0u8; 16];
        client_nonce.copy_from_slice(&input[41..57]);

        if !verify_timestamp(timestamp, MAX_TOKEN_AGE_SECS) {
            return Err(ProtocolError::AuthError(constants::ERR_INVALID_TIMESTAMP.into()));
        }
        if self.is_replay(ctx.peer_identity, &client_nonce, timestamp) {
            return Err(ProtocolError::AuthError(constants::ERR_REPLAY_ATTACK.into()));
        }

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let server_nonce = generate_nonce();

        let mut token = Vec::with_capacity(RESPONSE_LEN);
        token.push(TOKEN_RESPONSE);
        token.extend_from_slice(public.as_bytes());
        token.extend_from_slice(&server_nonce);
        token.extend_from_slice(&hash_nonce(&client_nonce));

        self.state = HandshakeState::AwaitConfirm {
            secret,
            client_public,
            client_nonce,
            server_nonce,
        };
        debug!(peer = ctx.peer_identity, "Acceptor responding to key agreement");
        Ok(token)
    }

    fn initiator_confirm(&mut self, ctx: &StepContext<'_>, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() != RESPONSE_LEN || input[0] != TOKEN_RESPONSE {
            return Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()));
        }
        let HandshakeState::AwaitResponse {
            secret,
            mut client_nonce,
        } = std::mem::replace(&mut self.state, HandshakeState::Failed)
        else {
            return Err(ProtocolError::AuthError(constants::ERR_UNEXPECTED_PDU.into()));
        };

        let mut server_public = [0u8; 32];
        server_public.copy_from_slice(&input[1..33]);
        let mut server_nonce = [0u8; 16];
        server_nonce.copy_from_slice(&input[33..49]);

        if self.is_replay(ctx.peer_identity, &server_nonce, 0) {
            return Err(ProtocolError::AuthError(constants::ERR_REPLAY_ATTACK.into()));
        }
        if hash_nonce(&client_nonce)[..] != input[49..81] {
            return Err(ProtocolError::AuthError(
                constants::ERR_NONCE_VERIFICATION_FAILED.into(),
            ));
        }

        let shared = secret.diffie_hellman(&PublicKey::from(server_public));
        let mut session_key = derive_session_key(&shared, &client_nonce, &server_nonce);
        let keys = DirectionalKeys::expand(&session_key, Role::Initiator);
        session_key.zeroize();
        client_nonce.zeroize();
        self.state = HandshakeState::Established(keys?);

        let mut token = Vec::with_capacity(CONFIRM_LEN);
        token.push(TOKEN_CONFIRM);
        token.extend_from_slice(&hash_nonce(&server_nonce));
        debug!("Initiator verified acceptor and derived session keys");
        Ok(token)
    }

    fn acceptor_finalize(&mut self, input: &[u8]) -> Result<()> {
        if input.len() != CONFIRM_LEN || input[0] != TOKEN_CONFIRM {
            return Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into()));
        }
        let HandshakeState::AwaitConfirm {
            secret,
            client_public,
            mut client_nonce,
            mut server_nonce,
        } = std::mem::replace(&mut self.state, HandshakeState::Failed)
        else {
            return Err(ProtocolError::AuthError(constants::ERR_UNEXPECTED_PDU.into()));
        };

        if hash_nonce(&server_nonce)[..] != input[1..33] {
            return Err(ProtocolError::AuthError(
                constants::ERR_NONCE_VERIFICATION_FAILED.into(),
            ));
        }

        let shared = secret.diffie_hellman(&PublicKey::from(client_public));
        let mut session_key = derive_session_key(&shared, &client_nonce, &server_nonce);
        let keys = DirectionalKeys::expand(&session_key, Role::Acceptor);
        session_key.zeroize();
        client_nonce.zeroize();
        server_nonce.zeroize();
        self.state = HandshakeState::Established(keys?);
        debug!("Acceptor finalized key agreement");
        Ok(())
    }
}

impl Mechanism for EcdhMechanism {
    fn name(&self) -> &'static str {
        "ecdh"
    }

    fn auth_type(&self) -> u8 {
        auth_type::ECDH
    }

    fn step(&mut self, ctx: &StepContext<'_>, input: Option<&[u8]>) -> Step {
        let result = match (self.role, self.phase(), input) {
            (Role::Initiator, Phase::Start, _) => self.initiator_start().map(Step::proceed),
            (Role::Initiator, Phase::AwaitResponse, Some(input)) => self
                .initiator_confirm(ctx, input)
                .map(|token| Step::established(Some(token))),
            (Role::Acceptor, Phase::Start, Some(input)) => {
                self.acceptor_respond(ctx, input).map(Step::proceed)
            }
            (Role::Acceptor, Phase::AwaitConfirm, Some(input)) => {
                self.acceptor_finalize(input).map(|_| Step::established(None))
            }
            _ => Err(ProtocolError::AuthError(constants::ERR_MALFORMED_TOKEN.into())),
        };
        match result {
            Ok(step) => step,
            Err(e) => {
                warn!(peer = ctx.peer_identity, error = %e, "Key agreement failed");
                self.state = HandshakeState::Failed;
                Step::failed(e.to_string())
            }
        }
    }

    fn is_established(&self) -> bool {
        matches!(self.state, HandshakeState::Established(_))
    }

    fn signature_len(&self) -> usize {
        TAG_LEN
    }

    fn sign(&mut self, seq: u32, message: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys()?.send));
        let tag = cipher
            .encrypt_in_place_detached(&aead_nonce(seq), message, &mut [])
            .map_err(|_| ProtocolError::AuthError(constants::ERR_SEAL_FAILED.into()))?;
        Ok(tag.to_vec())
    }

    fn verify(&mut self, seq: u32, message: &[u8], signature: &[u8]) -> bool {
        let Ok(keys) = self.keys() else {
            return false;
        };
        if signature.len() != TAG_LEN {
            return false;
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.recv));
        cipher
            .decrypt_in_place_detached(
                &aead_nonce(seq),
                message,
                &mut [],
                Tag::from_slice(signature),
            )
            .is_ok()
    }

    fn seal(&mut self, seq: u32, aad: &[u8], data: &mut [u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys()?.send));
        let tag = cipher
            .encrypt_in_place_detached(&aead_nonce(seq), aad, data)
            .map_err(|_| ProtocolError::AuthError(constants::ERR_SEAL_FAILED.into()))?;
        Ok(tag.to_vec())
    }

    fn unseal(&mut self, seq: u32, aad: &[u8], data: &mut [u8], tag: &[u8]) -> Result<()> {
        if tag.len() != TAG_LEN {
            return Err(ProtocolError::AuthError(constants::ERR_UNSEAL_FAILED.into()));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys()?.recv));
        cipher
            .decrypt_in_place_detached(&aead_nonce(seq), aad, data, Tag::from_slice(tag))
            .map_err(|_| ProtocolError::AuthError(constants::ERR_UNSEAL_FAILED.into()))
    }
}

/// Creates [`EcdhMechanism`]s sharing one replay cache.
#[derive(Clone)]
pub struct EcdhProvider {
    replay_cache: Arc<Mutex<ReplayCache>>,
}

impl EcdhProvider {
    pub fn new() -> Self {
        Self {
            replay_cache: Arc::new(Mutex::new(ReplayCache::new())),
        }
    }

    pub fn with_replay_cache(replay_cache: Arc<Mutex<ReplayCache>>) -> Self {
        Self { replay_cache }
    }
}

impl Default for EcdhProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MechanismProvider for EcdhProvider {
    fn name(&self) -> &'static str {
        "ecdh"
    }

    fn auth_type(&self) -> u8 {
        auth_type::ECDH
    }

    fn create(&self, role: Role) -> Box<dyn Mechanism> {
        Box::new(EcdhMechanism::new(role, Arc::clone(&self.replay_cache)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::security::StepStatus;

    const CTX: StepContext<'static> = StepContext {
        peer_identity: "127.0.0.1:49152",
        target_name: "host/server",
    };

    fn established_pair() -> (EcdhMechanism, EcdhMechanism) {
        let provider = EcdhProvider::new();
        let cache = Arc::clone(&provider.replay_cache);
        let mut client = EcdhMechanism::new(Role::Initiator, Arc::new(Mutex::new(ReplayCache::new())));
        let mut server = EcdhMechanism::new(Role::Acceptor, cache);

        let init = client.step(&CTX, None);
        assert_eq!(init.status, StepStatus::Continue);
        let resp = server.step(&CTX, init.token.as_deref());
        assert_eq!(resp.status, StepStatus::Continue);
        let confirm = client.step(&CTX, resp.token.as_deref());
        assert_eq!(confirm.status, StepStatus::Established);
        let done = server.step(&CTX, confirm.token.as_deref());
        assert_eq!(done.status, StepStatus::Established);
        assert!(done.token.is_none());
        (client, server)
    }

    #[test]
    fn test_three_leg_exchange_and_seal() {
        let (mut client, mut server) = established_pair();

        let mut data = b"stub bytes".to_vec();
        let tag = client.seal(0, b"header", &mut data).unwrap();
        assert_ne!(&data[..], b"stub bytes");
        server.unseal(0, b"header", &mut data, &tag).unwrap();
        assert_eq!(&data[..], b"stub bytes");

        let sig = server.sign(0, b"response").unwrap();
        assert!(client.verify(0, b"response", &sig));
    }

    #[test]
    fn test_wrong_sequence_fails_verification() {
        let (mut client, mut server) = established_pair();
        let sig = client.sign(3, b"request").unwrap();
        assert!(!server.verify(4, b"request", &sig));
        assert!(server.verify(3, b"request", &sig));
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let (mut client, _server) = established_pair();
        let sig = client.sign(0, b"echo").unwrap();
        // A reflected signature must not verify on the sender.
        assert!(!client.verify(0, b"echo", &sig));
    }

    #[test]
    fn test_replayed_init_rejected() {
        let cache = Arc::new(Mutex::new(ReplayCache::new()));
        let mut client = EcdhMechanism::new(Role::Initiator, Arc::new(Mutex::new(ReplayCache::new())));
        let init = client.step(&CTX, None).token.unwrap();

        let mut first = EcdhMechanism::new(Role::Acceptor, Arc::clone(&cache));
        assert_eq!(first.step(&CTX, Some(&init)).status, StepStatus::Continue);

        let mut second = EcdhMechanism::new(Role::Acceptor, cache);
        match second.step(&CTX, Some(&init)).status {
            StepStatus::Failed(reason) => assert!(reason.contains("Replay")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_confirm_rejected() {
        let mut client = EcdhMechanism::new(Role::Initiator, Arc::new(Mutex::new(ReplayCache::new())));
        let mut server = EcdhMechanism::new(Role::Acceptor, Arc::new(Mutex::new(ReplayCache::new())));
        let init = client.step(&CTX, None).token.unwrap();
        let resp = server.step(&CTX, Some(&init)).token.unwrap();
        let mut confirm = client.step(&CTX, Some(&resp)).token.unwrap();
        confirm[5] ^= 0xFF;
        assert!(matches!(
            server.step(&CTX, Some(&confirm)).status,
            StepStatus::Failed(_)
        ));
        assert!(!server.is_established());
    }

    #[test]
    fn test_timestamp_validation() {
        let now = current_timestamp().unwrap();
        assert!(verify_timestamp(now, 30));
        assert!(verify_timestamp(now - 10000, 30));
        assert!(!verify_timestamp(now - 31000, 30));
        assert!(verify_timestamp(now + 1000, 30));
        assert!(!verify_timestamp(now + 3000, 30));
    }

    #[test]
    fn test_sign_before_established_fails() {
        let mut client = EcdhMechanism::new(Role::Initiator, Arc::new(Mutex::new(ReplayCache::new())));
        assert!(client.sign(0, b"x").is_err());
        assert!(!client.verify(0, b"x", &[0u8; TAG_LEN]));
    }
}
