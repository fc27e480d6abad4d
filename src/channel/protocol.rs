//! Handshake driver
//!
//! Keeps at most one pending handshake per channel, verifies every incoming
//! handshake message against the contact's known keys and installs the
//! resulting session in the [`SessionTable`].
//!
//! Key agreement uses three X25519 operations, always in this order:
//! initiator static with responder ephemeral, initiator ephemeral with
//! responder static, then ephemeral with ephemeral. The session secret is
//! derived from those outputs and the response transcript.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::message::{
    init_transcript, response_transcript, ConfirmMessage, ConfirmationMac, HandshakeId,
    HandshakeMessage, InitMessage, ResponseMessage, PROTOCOL_VERSION,
};
use super::state::{ChannelEvent, ChannelState};
use crate::config::HandshakeConfig;
use crate::crypto::hash::constant_time_eq;
use crate::crypto::{
    try_random_bytes, DeviceId, EphemeralKeypair, Hash, HashOutput, IdentityId, SharedSecret,
};
use crate::error::{EngineError, EngineResult};
use crate::keystore::KeyStore;
use crate::registry::{unix_now, IdentityRegistry, LocalIdentity, TrustLevel};
use crate::session::{ChannelKey, ChannelSession, SessionId, SessionKeys, SessionState, SessionTable};

const SECRET_CONTEXT: &str = "parley-channel-v1 2024 session secret";
const SESSION_ID_CONTEXT: &str = "parley-channel-v1 2024 session id";
const RESPONDER_CONFIRM_CONTEXT: &str = "parley-channel-v1 2024 responder confirmation";
const INITIATOR_CONFIRM_CONTEXT: &str = "parley-channel-v1 2024 initiator confirmation";

enum Role {
    Initiator {
        ephemeral: EphemeralKeypair,
        init_transcript: HashOutput,
    },
    Responder {
        secret: Zeroizing<[u8; 32]>,
        response_transcript: HashOutput,
    },
}

struct PendingHandshake {
    handshake_id: HandshakeId,
    state: ChannelState,
    deadline: Instant,
    role: Role,
}

/// Result of processing one handshake message
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Channel the message belongs to
    pub key: ChannelKey,
    /// Channel state after processing
    pub state: ChannelState,
    /// Message to send back to the peer, if any
    pub reply: Option<HandshakeMessage>,
}

impl HandshakeOutcome {
    /// The handshake finished and a session is installed
    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established
    }
}

/// Runs the channel-establishment protocol
pub struct ChannelEngine {
    keystore: Arc<KeyStore>,
    registry: Arc<IdentityRegistry>,
    sessions: Arc<SessionTable>,
    config: HandshakeConfig,
    pending: Mutex<HashMap<ChannelKey, PendingHandshake>>,
    seen_inits: Mutex<HashMap<HandshakeId, Instant>>,
    timed_out: Mutex<HashMap<HandshakeId, Instant>>,
}

impl ChannelEngine {
    /// Create a channel engine over shared services
    pub fn new(
        keystore: Arc<KeyStore>,
        registry: Arc<IdentityRegistry>,
        sessions: Arc<SessionTable>,
        config: HandshakeConfig,
    ) -> Self {
        ChannelEngine {
            keystore,
            registry,
            sessions,
            config,
            pending: Mutex::new(HashMap::new()),
            seen_inits: Mutex::new(HashMap::new()),
            timed_out: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a channel
    pub fn state(&self, key: &ChannelKey) -> ChannelState {
        if let Some(pending) = self.pending.lock().get(key) {
            return pending.state;
        }
        self.session_state(key)
    }

    /// Start a handshake; returns the `Init` to send
    pub fn initiate_handshake(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        device: &DeviceId,
    ) -> EngineResult<HandshakeMessage> {
        self.initiate_handshake_at(local, remote, device, Instant::now())
    }

    /// [`ChannelEngine::initiate_handshake`] at an explicit time
    pub fn initiate_handshake_at(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        device: &DeviceId,
        now: Instant,
    ) -> EngineResult<HandshakeMessage> {
        let local_identity = self.registry.local_identity(local)?;
        let contact = self.registry.contact(local, remote)?;
        if contact.trust == TrustLevel::Revoked {
            return Err(EngineError::ContactRevoked);
        }
        if !contact.devices.contains(device) {
            return Err(EngineError::NotFound(format!(
                "device {} of contact {}",
                device,
                remote.short()
            )));
        }

        let key = ChannelKey::new(*local, *remote, *device);
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return Err(EngineError::AlreadyInProgress);
        }
        let state = self
            .session_state(&key)
            .transition(ChannelEvent::Initiate)
            .map_err(|_| EngineError::AlreadyInProgress)?;

        let handle = self.keystore.load_private_key(local)?;
        let ephemeral = EphemeralKeypair::generate()?;
        let handshake_id = HandshakeId(try_random_bytes()?);
        let transcript = init_transcript(
            &handshake_id,
            &local_identity.public,
            &local_identity.device,
            remote,
            device,
            ephemeral.public_key(),
        );
        let signature = self.keystore.sign(&handle, &transcript);

        let message = InitMessage {
            version: PROTOCOL_VERSION,
            handshake_id,
            sender: local_identity.public,
            sender_device: local_identity.device,
            recipient: *remote,
            recipient_device: *device,
            ephemeral: *ephemeral.public_key(),
            signature,
        };
        pending.insert(
            key,
            PendingHandshake {
                handshake_id,
                state,
                deadline: now + self.config.timeout(),
                role: Role::Initiator {
                    ephemeral,
                    init_transcript: transcript,
                },
            },
        );

        info!(channel = %key, handshake = ?handshake_id, "Handshake initiated");
        Ok(HandshakeMessage::Init(message))
    }

    /// Process an incoming handshake message
    pub fn handle_handshake_message(
        &self,
        message: &HandshakeMessage,
    ) -> EngineResult<HandshakeOutcome> {
        self.handle_handshake_message_at(message, Instant::now())
    }

    /// [`ChannelEngine::handle_handshake_message`] at an explicit time
    pub fn handle_handshake_message_at(
        &self,
        message: &HandshakeMessage,
        now: Instant,
    ) -> EngineResult<HandshakeOutcome> {
        if message.version() != PROTOCOL_VERSION {
            return Err(EngineError::Protocol(format!(
                "unsupported handshake version {}",
                message.version()
            )));
        }
        let (local, device) = message.recipient();
        let local = self.registry.local_identity(&local)?;
        if local.device != device {
            return Err(EngineError::Protocol(
                "handshake addressed to another device".into(),
            ));
        }
        debug!(
            step = message.step(),
            handshake = ?message.handshake_id(),
            "Handling handshake message"
        );

        match message {
            HandshakeMessage::Init(m) => self.on_init(m, &local, now),
            HandshakeMessage::Response(m) => self.on_response(m, &local, now),
            HandshakeMessage::Confirm(m) => self.on_confirm(m, &local, now),
        }
    }

    /// Drop pending handshakes whose deadline passed; returns their channels
    pub fn expire_pending(&self) -> Vec<ChannelKey> {
        self.expire_pending_at(Instant::now())
    }

    /// [`ChannelEngine::expire_pending`] at an explicit time
    pub fn expire_pending_at(&self, now: Instant) -> Vec<ChannelKey> {
        let mut expired = Vec::new();
        let mut pending = self.pending.lock();
        pending.retain(|key, handshake| {
            if handshake.deadline > now {
                return true;
            }
            warn!(channel = %key, handshake = ?handshake.handshake_id, "Handshake timed out");
            self.timed_out.lock().insert(handshake.handshake_id, now);
            expired.push(*key);
            false
        });
        drop(pending);

        self.prune(now);
        expired
    }

    /// Drop a pending handshake; returns whether one existed.
    ///
    /// An aborted response never reached the initiator, so its `Init` is
    /// forgotten and will be answered again when redelivered.
    pub fn abort_handshake(&self, key: &ChannelKey) -> bool {
        let Some(handshake) = self.pending.lock().remove(key) else {
            return false;
        };
        if let Role::Responder { .. } = handshake.role {
            self.seen_inits.lock().remove(&handshake.handshake_id);
        }
        info!(channel = %key, handshake = ?handshake.handshake_id, "Handshake aborted");
        true
    }

    /// Drop every pending handshake of a local identity
    pub fn abort_local(&self, local: &IdentityId) {
        self.pending.lock().retain(|key, _| &key.local != local);
    }

    fn on_init(
        &self,
        m: &InitMessage,
        local: &LocalIdentity,
        now: Instant,
    ) -> EngineResult<HandshakeOutcome> {
        let remote = m.sender.id();
        let contact = self.registry.contact(&local.id(), &remote).map_err(|_| {
            EngineError::AuthenticationFailure(format!("unknown sender {}", remote.short()))
        })?;
        if contact.public != m.sender {
            return Err(EngineError::AuthenticationFailure(
                "sender keys do not match contact".into(),
            ));
        }
        match contact.trust {
            TrustLevel::Revoked => return Err(EngineError::ContactRevoked),
            TrustLevel::Unverified => {
                warn!(contact = %remote.short(), "Handshake from unverified contact")
            }
            TrustLevel::Trusted => {}
        }
        let t1 = m.transcript();
        m.sender.verify(&t1, &m.signature).map_err(|_| {
            EngineError::AuthenticationFailure("init signature does not verify".into())
        })?;

        self.prune(now);
        {
            let mut seen = self.seen_inits.lock();
            if seen.contains_key(&m.handshake_id) {
                warn!(handshake = ?m.handshake_id, "Replayed handshake init");
                return Err(EngineError::ReplayDetected);
            }
            seen.insert(m.handshake_id, now);
        }

        if self
            .registry
            .add_contact_device(&local.id(), &remote, m.sender_device)?
        {
            info!(contact = %remote.short(), device = %m.sender_device, "Learned contact device");
        }

        let key = ChannelKey::new(local.id(), remote, m.sender_device);
        let mut pending = self.pending.lock();
        let current = match pending.get(&key) {
            Some(p) => p.state,
            None => self.session_state(&key),
        };
        let local_wins = (local.id(), local.device) < (remote, m.sender_device);
        let next = current
            .transition(ChannelEvent::PeerInit { local_wins })
            .map_err(|e| EngineError::Protocol(format!("{:?} in state {}", e.event, e.from)))?;

        if next == ChannelState::HandshakeInitiated {
            info!(channel = %key, "Concurrent handshake: local attempt wins, ignoring peer init");
            return Ok(HandshakeOutcome {
                key,
                state: next,
                reply: None,
            });
        }
        if current == ChannelState::HandshakeInitiated {
            info!(channel = %key, "Concurrent handshake: yielding to peer");
        }

        let handle = self.keystore.load_private_key(&local.id())?;
        let local_public = handle.public_identity();
        let ephemeral = EphemeralKeypair::generate()?;
        let t2 = response_transcript(&t1, &local_public, ephemeral.public_key());

        let secret = derive_secret(
            [
                ephemeral.diffie_hellman(&m.sender.agreement)?,
                self.keystore.perform_key_agreement(&handle, &m.ephemeral)?,
                ephemeral.diffie_hellman(&m.ephemeral)?,
            ],
            &t2,
        );
        let response = ResponseMessage {
            version: PROTOCOL_VERSION,
            handshake_id: m.handshake_id,
            sender: local.id(),
            sender_device: local.device,
            recipient: remote,
            recipient_device: m.sender_device,
            ephemeral: *ephemeral.public_key(),
            signature: self.keystore.sign(&handle, &t2),
            confirmation: ConfirmationMac(confirmation_mac(
                &secret,
                RESPONDER_CONFIRM_CONTEXT,
                &t2,
            )),
        };

        pending.insert(
            key,
            PendingHandshake {
                handshake_id: m.handshake_id,
                state: next,
                deadline: now + self.config.timeout(),
                role: Role::Responder {
                    secret,
                    response_transcript: t2,
                },
            },
        );

        info!(channel = %key, handshake = ?m.handshake_id, "Responded to handshake");
        Ok(HandshakeOutcome {
            key,
            state: next,
            reply: Some(HandshakeMessage::Response(response)),
        })
    }

    fn on_response(
        &self,
        m: &ResponseMessage,
        local: &LocalIdentity,
        now: Instant,
    ) -> EngineResult<HandshakeOutcome> {
        let key = ChannelKey::new(local.id(), m.sender, m.sender_device);
        let mut pending = self.pending.lock();
        let handshake = self.take_pending(&mut pending, &key, &m.handshake_id, now)?;

        let Role::Initiator {
            ephemeral,
            init_transcript,
        } = &handshake.role
        else {
            pending.insert(key, handshake);
            return Err(EngineError::Protocol("response for a handshake we did not initiate".into()));
        };
        let Ok(next) = handshake.state.transition(ChannelEvent::PeerResponse) else {
            pending.insert(key, handshake);
            return Err(EngineError::Protocol("unexpected handshake response".into()));
        };

        let contact = self.registry.contact(&local.id(), &m.sender)?;
        if contact.trust == TrustLevel::Revoked {
            return Err(EngineError::ContactRevoked);
        }
        let t2 = response_transcript(init_transcript, &contact.public, &m.ephemeral);
        if contact.public.verify(&t2, &m.signature).is_err() {
            warn!(channel = %key, "Response signature does not verify");
            pending.insert(key, handshake);
            return Err(EngineError::AuthenticationFailure(
                "response signature does not verify".into(),
            ));
        }

        let handle = self.keystore.load_private_key(&local.id())?;
        let secret = derive_secret(
            [
                self.keystore.perform_key_agreement(&handle, &m.ephemeral)?,
                ephemeral.diffie_hellman(&contact.public.agreement)?,
                ephemeral.diffie_hellman(&m.ephemeral)?,
            ],
            &t2,
        );
        let expected = confirmation_mac(&secret, RESPONDER_CONFIRM_CONTEXT, &t2);
        if !constant_time_eq(&expected, &m.confirmation.0) {
            warn!(channel = %key, "Responder key confirmation mismatch");
            return Err(EngineError::AuthenticationFailure(
                "key confirmation mismatch".into(),
            ));
        }

        self.install_session(&key, local, &secret, &t2)?;
        let confirm = ConfirmMessage {
            version: PROTOCOL_VERSION,
            handshake_id: m.handshake_id,
            sender: local.id(),
            sender_device: local.device,
            recipient: m.sender,
            recipient_device: m.sender_device,
            confirmation: ConfirmationMac(confirmation_mac(
                &secret,
                INITIATOR_CONFIRM_CONTEXT,
                &t2,
            )),
        };

        info!(channel = %key, handshake = ?m.handshake_id, "Channel established as initiator");
        Ok(HandshakeOutcome {
            key,
            state: next,
            reply: Some(HandshakeMessage::Confirm(confirm)),
        })
    }

    fn on_confirm(
        &self,
        m: &ConfirmMessage,
        local: &LocalIdentity,
        now: Instant,
    ) -> EngineResult<HandshakeOutcome> {
        let key = ChannelKey::new(local.id(), m.sender, m.sender_device);
        let mut pending = self.pending.lock();
        let handshake = self.take_pending(&mut pending, &key, &m.handshake_id, now)?;

        let Role::Responder {
            secret,
            response_transcript,
        } = &handshake.role
        else {
            pending.insert(key, handshake);
            return Err(EngineError::Protocol("confirm for a handshake we did not answer".into()));
        };
        let Ok(next) = handshake.state.transition(ChannelEvent::PeerConfirm) else {
            pending.insert(key, handshake);
            return Err(EngineError::Protocol("unexpected handshake confirm".into()));
        };

        let expected = confirmation_mac(secret, INITIATOR_CONFIRM_CONTEXT, response_transcript);
        if !constant_time_eq(&expected, &m.confirmation.0) {
            warn!(channel = %key, "Initiator key confirmation mismatch");
            pending.insert(key, handshake);
            return Err(EngineError::AuthenticationFailure(
                "key confirmation mismatch".into(),
            ));
        }

        self.install_session(&key, local, secret, response_transcript)?;
        info!(channel = %key, handshake = ?m.handshake_id, "Channel established as responder");
        Ok(HandshakeOutcome {
            key,
            state: next,
            reply: None,
        })
    }

    /// Remove the pending handshake a reply refers to, enforcing id and
    /// deadline
    fn take_pending(
        &self,
        pending: &mut HashMap<ChannelKey, PendingHandshake>,
        key: &ChannelKey,
        handshake_id: &HandshakeId,
        now: Instant,
    ) -> EngineResult<PendingHandshake> {
        let matches = pending
            .get(key)
            .map_or(false, |p| &p.handshake_id == handshake_id);
        if !matches {
            if self.timed_out.lock().contains_key(handshake_id) {
                return Err(EngineError::Timeout);
            }
            return Err(EngineError::Protocol(format!(
                "no pending handshake {handshake_id:?} on {key}"
            )));
        }

        let handshake = pending
            .remove(key)
            .ok_or_else(|| EngineError::Protocol("pending handshake vanished".into()))?;
        if handshake.deadline <= now {
            warn!(channel = %key, handshake = ?handshake_id, "Handshake reply arrived too late");
            self.timed_out.lock().insert(*handshake_id, now);
            return Err(EngineError::Timeout);
        }
        Ok(handshake)
    }

    fn install_session(
        &self,
        key: &ChannelKey,
        local: &LocalIdentity,
        secret: &[u8; 32],
        transcript: &HashOutput,
    ) -> EngineResult<()> {
        let session_id = SessionId(Hash::hash_fields(SESSION_ID_CONTEXT, &[transcript.as_slice()]));
        let keys = SessionKeys::derive(
            secret,
            (&key.local, &local.device),
            (&key.remote, &key.device),
        );
        self.sessions.install(ChannelSession::new(
            *key,
            local.device,
            session_id,
            keys,
            self.sessions.config().replay_window,
            unix_now(),
        ))
    }

    fn session_state(&self, key: &ChannelKey) -> ChannelState {
        match self.sessions.state(key) {
            None => ChannelState::NoSession,
            Some(SessionState::Established) => ChannelState::Established,
            Some(SessionState::Revoked) => ChannelState::Revoked,
            Some(SessionState::Expired) => ChannelState::Expired,
        }
    }

    /// Forget replay and timeout bookkeeping older than twice the timeout
    fn prune(&self, now: Instant) {
        let horizon = self.config.timeout() * 2;
        let fresh = |at: &mut Instant| now.saturating_duration_since(*at) < horizon;
        self.seen_inits.lock().retain(|_, at| fresh(at));
        self.timed_out.lock().retain(|_, at| fresh(at));
    }
}

fn derive_secret(shared: [SharedSecret; 3], transcript: &HashOutput) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new(Vec::with_capacity(3 * 32 + transcript.len()));
    for part in &shared {
        material.extend_from_slice(part.as_bytes());
    }
    material.extend_from_slice(transcript);
    Zeroizing::new(Hash::derive_key(SECRET_CONTEXT, &material))
}

fn confirmation_mac(secret: &[u8; 32], context: &str, transcript: &HashOutput) -> [u8; 32] {
    let key = Zeroizing::new(Hash::derive_key(context, secret));
    Hash::mac(&key, transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use std::time::Duration;

    struct Peer {
        registry: Arc<IdentityRegistry>,
        sessions: Arc<SessionTable>,
        channels: ChannelEngine,
        local: LocalIdentity,
    }

    impl Peer {
        fn new() -> Self {
            let keystore = Arc::new(KeyStore::in_memory().unwrap());
            let registry = Arc::new(
                IdentityRegistry::open(
                    keystore.clone(),
                    crate::storage::SealedStore::in_memory().unwrap(),
                )
                .unwrap(),
            );
            let sessions = Arc::new(SessionTable::in_memory(SessionConfig::default()).unwrap());
            let channels = ChannelEngine::new(
                keystore,
                registry.clone(),
                sessions.clone(),
                HandshakeConfig { timeout_ms: 1_000 },
            );
            let local = registry.create_identity().unwrap();
            Peer {
                registry,
                sessions,
                channels,
                local,
            }
        }

        fn id(&self) -> IdentityId {
            self.local.id()
        }

        fn knows(&self, other: &Peer) {
            self.registry
                .add_contact(&self.id(), other.local.public, TrustLevel::Trusted)
                .unwrap();
            self.registry
                .add_contact_device(&self.id(), &other.id(), other.local.device)
                .unwrap();
        }

        fn key_to(&self, other: &Peer) -> ChannelKey {
            ChannelKey::new(self.id(), other.id(), other.local.device)
        }
    }

    fn introduced() -> (Peer, Peer) {
        let alice = Peer::new();
        let bob = Peer::new();
        alice.knows(&bob);
        bob.knows(&alice);
        (alice, bob)
    }

    fn establish(alice: &Peer, bob: &Peer) {
        let init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        let response = bob.channels.handle_handshake_message(&init).unwrap();
        let confirm = alice
            .channels
            .handle_handshake_message(response.reply.as_ref().unwrap())
            .unwrap();
        assert!(confirm.is_established());
        let done = bob
            .channels
            .handle_handshake_message(confirm.reply.as_ref().unwrap())
            .unwrap();
        assert!(done.is_established());
    }

    #[test]
    fn test_full_handshake() {
        let (alice, bob) = introduced();
        let a_key = alice.key_to(&bob);
        let b_key = bob.key_to(&alice);

        let init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        assert_eq!(alice.channels.state(&a_key), ChannelState::HandshakeInitiated);

        let response = bob.channels.handle_handshake_message(&init).unwrap();
        assert_eq!(response.state, ChannelState::HandshakeRespondedTo);
        assert_eq!(bob.channels.state(&b_key), ChannelState::HandshakeRespondedTo);

        let confirm = alice
            .channels
            .handle_handshake_message(response.reply.as_ref().unwrap())
            .unwrap();
        assert_eq!(alice.channels.state(&a_key), ChannelState::Established);

        bob.channels
            .handle_handshake_message(confirm.reply.as_ref().unwrap())
            .unwrap();
        assert_eq!(bob.channels.state(&b_key), ChannelState::Established);

        // Both ends derived the same session
        assert_eq!(alice.sessions.session_id(&a_key), bob.sessions.session_id(&b_key));
        let (seq, ct) = alice.sessions.encrypt(&a_key, b"hello").unwrap();
        assert_eq!(bob.sessions.decrypt(&b_key, seq, &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_rehandshake_yields_fresh_keys() {
        let (alice, bob) = introduced();
        let a_key = alice.key_to(&bob);
        establish(&alice, &bob);
        let first = alice.sessions.session_id(&a_key).unwrap();

        alice.sessions.revoke(&a_key).unwrap();
        establish(&alice, &bob);
        let second = alice.sessions.session_id(&a_key).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_already_in_progress() {
        let (alice, bob) = introduced();
        alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        assert!(matches!(
            alice
                .channels
                .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device),
            Err(EngineError::AlreadyInProgress)
        ));
    }

    #[test]
    fn test_unknown_contact_and_device() {
        let (alice, bob) = introduced();
        let stranger = Peer::new();
        assert!(matches!(
            alice
                .channels
                .initiate_handshake(&alice.id(), &stranger.id(), &stranger.local.device),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            alice
                .channels
                .initiate_handshake(&alice.id(), &bob.id(), &DeviceId([0xAA; 16])),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_revoked_contact() {
        let (alice, bob) = introduced();
        alice
            .registry
            .set_trust(&alice.id(), &bob.id(), TrustLevel::Revoked)
            .unwrap();
        assert!(matches!(
            alice
                .channels
                .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device),
            Err(EngineError::ContactRevoked)
        ));
    }

    #[test]
    fn test_init_from_unknown_sender_rejected() {
        let (alice, bob) = introduced();
        let mallory = Peer::new();
        mallory.knows(&bob);
        let init = mallory
            .channels
            .initiate_handshake(&mallory.id(), &bob.id(), &bob.local.device)
            .unwrap();
        assert!(matches!(
            bob.channels.handle_handshake_message(&init),
            Err(EngineError::AuthenticationFailure(_))
        ));
        drop(alice);
    }

    #[test]
    fn test_tampered_init_rejected() {
        let (alice, bob) = introduced();
        let mut init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        if let HandshakeMessage::Init(m) = &mut init {
            m.ephemeral = *EphemeralKeypair::generate().unwrap().public_key();
        }
        assert!(matches!(
            bob.channels.handle_handshake_message(&init),
            Err(EngineError::AuthenticationFailure(_))
        ));
        assert_eq!(bob.channels.state(&bob.key_to(&alice)), ChannelState::NoSession);
    }

    #[test]
    fn test_replayed_init_rejected() {
        let (alice, bob) = introduced();
        let init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        bob.channels.handle_handshake_message(&init).unwrap();
        assert!(matches!(
            bob.channels.handle_handshake_message(&init),
            Err(EngineError::ReplayDetected)
        ));
    }

    #[test]
    fn test_aborted_response_answers_redelivered_init() {
        let (alice, bob) = introduced();
        let init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        // The first Response never leaves bob
        bob.channels.handle_handshake_message(&init).unwrap();
        assert!(bob.channels.abort_handshake(&bob.key_to(&alice)));

        let response = bob.channels.handle_handshake_message(&init).unwrap();
        let confirm = alice
            .channels
            .handle_handshake_message(response.reply.as_ref().unwrap())
            .unwrap();
        assert!(confirm.is_established());
        let done = bob
            .channels
            .handle_handshake_message(confirm.reply.as_ref().unwrap())
            .unwrap();
        assert!(done.is_established());

        // Once completed the Init counts as seen again
        assert!(matches!(
            bob.channels.handle_handshake_message(&init),
            Err(EngineError::ReplayDetected)
        ));
    }

    #[test]
    fn test_unverified_contact_can_handshake() {
        let (alice, bob) = introduced();
        bob.registry
            .set_trust(&bob.id(), &alice.id(), TrustLevel::Unverified)
            .unwrap();
        establish(&alice, &bob);
        assert_eq!(
            bob.channels.state(&bob.key_to(&alice)),
            ChannelState::Established
        );
    }

    #[test]
    fn test_tampered_response_keeps_pending() {
        let (alice, bob) = introduced();
        let init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        let mut response = bob.channels.handle_handshake_message(&init).unwrap().reply.unwrap();
        if let HandshakeMessage::Response(m) = &mut response {
            m.signature.0[0] ^= 1;
        }
        assert!(matches!(
            alice.channels.handle_handshake_message(&response),
            Err(EngineError::AuthenticationFailure(_))
        ));
        assert_eq!(
            alice.channels.state(&alice.key_to(&bob)),
            ChannelState::HandshakeInitiated
        );
    }

    #[test]
    fn test_bad_confirmation_rejected() {
        let (alice, bob) = introduced();
        let init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        let response = bob.channels.handle_handshake_message(&init).unwrap().reply.unwrap();
        let mut confirm = alice
            .channels
            .handle_handshake_message(&response)
            .unwrap()
            .reply
            .unwrap();
        if let HandshakeMessage::Confirm(m) = &mut confirm {
            m.confirmation.0[3] ^= 0x10;
        }
        assert!(matches!(
            bob.channels.handle_handshake_message(&confirm),
            Err(EngineError::AuthenticationFailure(_))
        ));
        assert_eq!(
            bob.channels.state(&bob.key_to(&alice)),
            ChannelState::HandshakeRespondedTo
        );
    }

    #[test]
    fn test_late_response_times_out() {
        let (alice, bob) = introduced();
        let start = Instant::now();
        let init = alice
            .channels
            .initiate_handshake_at(&alice.id(), &bob.id(), &bob.local.device, start)
            .unwrap();
        let response = bob
            .channels
            .handle_handshake_message_at(&init, start)
            .unwrap()
            .reply
            .unwrap();

        let late = start + Duration::from_secs(2);
        assert!(matches!(
            alice.channels.handle_handshake_message_at(&response, late),
            Err(EngineError::Timeout)
        ));
        assert_eq!(alice.channels.state(&alice.key_to(&bob)), ChannelState::NoSession);
    }

    #[test]
    fn test_expire_pending() {
        let (alice, bob) = introduced();
        let start = Instant::now();
        let init = alice
            .channels
            .initiate_handshake_at(&alice.id(), &bob.id(), &bob.local.device, start)
            .unwrap();
        let response = bob
            .channels
            .handle_handshake_message_at(&init, start)
            .unwrap()
            .reply
            .unwrap();

        assert!(alice
            .channels
            .expire_pending_at(start + Duration::from_millis(500))
            .is_empty());
        let expired = alice
            .channels
            .expire_pending_at(start + Duration::from_millis(1_500));
        assert_eq!(expired, vec![alice.key_to(&bob)]);

        // The response to the swept handshake reports the timeout
        assert!(matches!(
            alice
                .channels
                .handle_handshake_message_at(&response, start + Duration::from_millis(1_600)),
            Err(EngineError::Timeout)
        ));
    }

    #[test]
    fn test_simultaneous_initiation_converges() {
        let (alice, bob) = introduced();
        let a_init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        let b_init = bob
            .channels
            .initiate_handshake(&bob.id(), &alice.id(), &alice.local.device)
            .unwrap();

        let a_out = alice.channels.handle_handshake_message(&b_init).unwrap();
        let b_out = bob.channels.handle_handshake_message(&a_init).unwrap();

        // Exactly one side yields and responds
        let alice_wins = (alice.id(), alice.local.device) < (bob.id(), bob.local.device);
        let (winner, loser, loser_out, winner_out) = if alice_wins {
            (&alice, &bob, b_out, a_out)
        } else {
            (&bob, &alice, a_out, b_out)
        };
        assert!(winner_out.reply.is_none());
        assert_eq!(winner_out.state, ChannelState::HandshakeInitiated);
        assert_eq!(loser_out.state, ChannelState::HandshakeRespondedTo);

        let confirm = winner
            .channels
            .handle_handshake_message(loser_out.reply.as_ref().unwrap())
            .unwrap();
        loser
            .channels
            .handle_handshake_message(confirm.reply.as_ref().unwrap())
            .unwrap();

        assert_eq!(
            winner.channels.state(&winner.key_to(loser)),
            ChannelState::Established
        );
        assert_eq!(
            loser.channels.state(&loser.key_to(winner)),
            ChannelState::Established
        );
        assert_eq!(
            winner.sessions.session_id(&winner.key_to(loser)),
            loser.sessions.session_id(&loser.key_to(winner))
        );
    }

    #[test]
    fn test_wrong_device_rejected() {
        let (alice, bob) = introduced();
        let mut init = alice
            .channels
            .initiate_handshake(&alice.id(), &bob.id(), &bob.local.device)
            .unwrap();
        if let HandshakeMessage::Init(m) = &mut init {
            m.recipient_device = DeviceId([0x55; 16]);
        }
        assert!(matches!(
            bob.channels.handle_handshake_message(&init),
            Err(EngineError::Protocol(_))
        ));
    }
}
