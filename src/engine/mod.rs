//! Application-facing engine
//!
//! [`Engine`] wires the key store, registry, session table, channel engine,
//! relay client and dispatch queues together. Sending to a channel without
//! a session starts a handshake and waits for it; the handshake only
//! completes while [`Engine::run_inbound`] (or [`Engine::poll_once`]) is
//! processing the local identity's mailbox.

mod envelope;

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

pub use envelope::Envelope;

use crate::channel::{ChannelEngine, ChannelState, HandshakeMessage, HandshakeOutcome};
use crate::config::EngineConfig;
use crate::crypto::{DeviceId, IdentityId, PublicIdentity};
use crate::dispatch::DispatchQueues;
use crate::error::{EngineError, EngineResult, HandshakeFailure};
use crate::keystore::KeyStore;
use crate::registry::{Contact, IdentityRegistry, LocalIdentity, TrustLevel};
use crate::server::{
    CancelToken, InboundMessage, MessageId, OutboundMessage, RelayApi, ServerInterface,
};
use crate::session::{ChannelKey, SessionState, SessionTable};
use crate::storage::{SealedStore, Storage, StorageKey};

/// A decrypted message handed to the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Local identity it was addressed to
    pub local: IdentityId,
    /// Sending identity
    pub sender: IdentityId,
    /// Sending device
    pub sender_device: DeviceId,
    /// Sender's sequence number
    pub sequence: u64,
    /// Decrypted content
    pub plaintext: Vec<u8>,
}

/// Internal events worth surfacing to the application
#[derive(Clone, Debug)]
pub enum Diagnostic {
    /// An inbound message was discarded
    InboundDropped {
        /// Mailbox owner
        local: IdentityId,
        /// Claimed sender
        sender: IdentityId,
        /// Claimed sender device
        sender_device: DeviceId,
        /// Relay id of the dropped message
        message_id: MessageId,
        /// Why it was dropped
        reason: String,
        /// A cryptographic check failed
        cryptographic: bool,
    },
    /// A pending handshake passed its deadline
    HandshakeTimedOut {
        /// Affected channel
        key: ChannelKey,
    },
    /// A handshake completed
    ChannelEstablished {
        /// The new channel
        key: ChannelKey,
    },
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// The identity and channel engine
pub struct Engine {
    config: EngineConfig,
    registry: Arc<IdentityRegistry>,
    sessions: Arc<SessionTable>,
    channels: ChannelEngine,
    server: ServerInterface,
    dispatch: DispatchQueues,
    received: RwLock<Vec<Handler<ReceivedMessage>>>,
    diagnostics: RwLock<Vec<Handler<Diagnostic>>>,
}

impl Engine {
    /// Engine with in-memory state
    pub fn new(config: EngineConfig, relay: Arc<dyn RelayApi>) -> EngineResult<Self> {
        Self::with_store(config, relay, SealedStore::in_memory()?)
    }

    /// Engine persisting to `storage`, sealed under `storage_key`
    pub fn open(
        config: EngineConfig,
        relay: Arc<dyn RelayApi>,
        storage: Arc<dyn Storage>,
        storage_key: StorageKey,
    ) -> EngineResult<Self> {
        Self::with_store(config, relay, SealedStore::new(storage, storage_key))
    }

    fn with_store(
        config: EngineConfig,
        relay: Arc<dyn RelayApi>,
        store: SealedStore,
    ) -> EngineResult<Self> {
        config.validate()?;

        let keystore = Arc::new(KeyStore::open(store.clone()));
        let registry = Arc::new(IdentityRegistry::open(keystore.clone(), store.clone())?);
        let sessions = Arc::new(SessionTable::open(store, config.session.clone())?);
        let channels = ChannelEngine::new(
            keystore,
            registry.clone(),
            sessions.clone(),
            config.handshake.clone(),
        );
        let server = ServerInterface::new(relay, config.retry.clone(), config.relay.clone());

        info!(
            identities = registry.local_identities().len(),
            "Engine ready"
        );
        Ok(Engine {
            config,
            registry,
            sessions,
            channels,
            server,
            dispatch: DispatchQueues::new(),
            received: RwLock::new(Vec::new()),
            diagnostics: RwLock::new(Vec::new()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Identities and contacts ───

    /// Create a local identity with a fresh device id
    pub fn create_identity(&self) -> EngineResult<LocalIdentity> {
        self.registry.create_identity()
    }

    /// Look up a local identity
    pub fn local_identity(&self, id: &IdentityId) -> EngineResult<LocalIdentity> {
        self.registry.local_identity(id)
    }

    /// All local identities
    pub fn local_identities(&self) -> Vec<LocalIdentity> {
        self.registry.local_identities()
    }

    /// Attach an application-defined metadata entry to a local identity
    pub fn set_identity_metadata(
        &self,
        id: &IdentityId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> EngineResult<()> {
        self.registry.set_identity_metadata(id, key, value)
    }

    /// Delete a local identity with its keys, contacts and sessions
    pub fn delete_identity(&self, id: &IdentityId) -> EngineResult<()> {
        self.registry.local_identity(id)?;
        self.channels.abort_local(id);
        self.dispatch.forget(|key| &key.local == id);
        self.sessions.remove_local(id)?;
        self.registry.delete_identity(id)
    }

    /// Add a contact or change its trust level
    pub fn add_contact(
        &self,
        local: &IdentityId,
        public: PublicIdentity,
        trust: TrustLevel,
    ) -> EngineResult<Contact> {
        let contact = self.registry.add_contact(local, public, trust)?;
        if trust == TrustLevel::Revoked {
            self.cut_off(local, &contact);
        }
        Ok(contact)
    }

    /// Contacts of a local identity
    pub fn contacts(&self, local: &IdentityId) -> Vec<Contact> {
        self.registry.contacts(local)
    }

    /// Record a device for a contact; returns whether it was new
    pub fn add_contact_device(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        device: DeviceId,
    ) -> EngineResult<bool> {
        self.registry.add_contact_device(local, remote, device)
    }

    /// Change a contact's trust level. Revoking also revokes every session
    /// with the contact and abandons pending handshakes.
    pub fn set_trust(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        trust: TrustLevel,
    ) -> EngineResult<()> {
        self.registry.set_trust(local, remote, trust)?;
        if trust == TrustLevel::Revoked {
            let contact = self.registry.contact(local, remote)?;
            self.cut_off(local, &contact);
        }
        Ok(())
    }

    /// Remove a contact and every session with it
    pub fn remove_contact(&self, local: &IdentityId, remote: &IdentityId) -> EngineResult<()> {
        let contact = self.registry.contact(local, remote)?;
        for device in &contact.devices {
            self.channels
                .abort_handshake(&ChannelKey::new(*local, *remote, *device));
        }
        self.dispatch
            .forget(|key| &key.local == local && &key.remote == remote);
        self.sessions.remove_remote(local, remote)?;
        self.registry.remove_contact(local, remote)
    }

    fn cut_off(&self, local: &IdentityId, contact: &Contact) {
        let remote = contact.id();
        for key in self.sessions.channels_with(local, &remote) {
            self.dispatch.revoke(&key);
            if matches!(
                self.sessions.state(&key),
                Some(SessionState::Established | SessionState::Expired)
            ) {
                if let Err(e) = self.sessions.revoke(&key) {
                    warn!(channel = %key, error = %e, "Failed to revoke session");
                }
            }
        }
        for device in &contact.devices {
            let key = ChannelKey::new(*local, remote, *device);
            if self.channels.abort_handshake(&key) {
                self.dispatch.complete(
                    &key,
                    Err(HandshakeFailure::Other("contact revoked".into())),
                );
            }
        }
    }

    // ─── Callbacks ───

    /// Register a handler for decrypted messages
    pub fn on_message_received<F>(&self, handler: F)
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.received.write().push(Arc::new(handler));
    }

    /// Register a handler for diagnostic events
    pub fn on_diagnostic<F>(&self, handler: F)
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        self.diagnostics.write().push(Arc::new(handler));
    }

    fn emit_received(&self, message: &ReceivedMessage) {
        let handlers = self.received.read().clone();
        for handler in handlers {
            handler(message);
        }
    }

    fn emit_diagnostic(&self, event: Diagnostic) {
        let handlers = self.diagnostics.read().clone();
        for handler in handlers {
            handler(&event);
        }
    }

    // ─── Channels ───

    /// Where a channel stands
    pub fn channel_state(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        device: &DeviceId,
    ) -> ChannelState {
        self.channels
            .state(&ChannelKey::new(*local, *remote, *device))
    }

    /// Establish a channel, re-handshaking a revoked or expired one.
    ///
    /// Returns once the channel is established.
    pub async fn establish_channel(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        device: &DeviceId,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let identity = self.registry.local_identity(local)?;
        self.handshake(&identity, &ChannelKey::new(*local, *remote, *device), cancel)
            .await
    }

    /// Revoke a channel's session; in-flight uploads on it are abandoned
    pub fn revoke_session(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        device: &DeviceId,
    ) -> EngineResult<()> {
        let key = ChannelKey::new(*local, *remote, *device);
        self.dispatch.revoke(&key);
        self.sessions.revoke(&key)
    }

    /// Encrypt and upload a message, establishing the channel first if it
    /// has no usable session
    pub async fn send_message(
        &self,
        local: &IdentityId,
        remote: &IdentityId,
        device: &DeviceId,
        plaintext: &[u8],
        cancel: &CancelToken,
    ) -> EngineResult<MessageId> {
        let identity = self.registry.local_identity(local)?;
        if self.registry.contact(local, remote)?.trust == TrustLevel::Revoked {
            return Err(EngineError::ContactRevoked);
        }
        let key = ChannelKey::new(*local, *remote, *device);

        // A session can expire between the state check and encryption; one
        // more round re-handshakes it
        for _ in 0..2 {
            self.ensure_channel(&identity, &key, cancel).await?;
            match self.send_on_session(&identity, &key, plaintext, cancel).await {
                Err(EngineError::SessionNotEstablished) => continue,
                other => return other,
            }
        }
        Err(EngineError::SessionNotEstablished)
    }

    async fn ensure_channel(
        &self,
        identity: &LocalIdentity,
        key: &ChannelKey,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        match self.channels.state(key) {
            ChannelState::Established => Ok(()),
            ChannelState::Revoked => Err(EngineError::SessionRevoked),
            ChannelState::NoSession
            | ChannelState::Expired
            | ChannelState::HandshakeInitiated
            | ChannelState::HandshakeRespondedTo => self.handshake(identity, key, cancel).await,
        }
    }

    async fn handshake(
        &self,
        identity: &LocalIdentity,
        key: &ChannelKey,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let (started, waiter) = self.dispatch.begin_handshake(key);
        let mut initiated = false;
        if started {
            match self.start_handshake(identity, key, cancel).await {
                Ok(()) => initiated = true,
                // Either established in the meantime, or a handshake the peer
                // started is pending and completes through the inbound path
                Err(EngineError::AlreadyInProgress) => {
                    if self.channels.state(key) == ChannelState::Established {
                        self.dispatch.complete(key, Ok(()));
                        return Ok(());
                    }
                    debug!(channel = %key, "Joining handshake already in progress");
                }
                Err(e) => {
                    let failure = handshake_failure(&e);
                    self.dispatch.complete(key, Err(failure.clone()));
                    return Err(EngineError::HandshakeFailed(failure));
                }
            }
        }

        let result = waiter.wait(self.config.handshake.timeout(), cancel).await;
        if let Err(EngineError::HandshakeFailed(failure)) = &result {
            let abandon = match failure {
                HandshakeFailure::Timeout => true,
                HandshakeFailure::Cancelled => initiated,
                _ => false,
            };
            if abandon && self.channels.abort_handshake(key) {
                self.dispatch.complete(key, Err(failure.clone()));
            }
        }
        result
    }

    async fn start_handshake(
        &self,
        identity: &LocalIdentity,
        key: &ChannelKey,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let init = self
            .channels
            .initiate_handshake(&key.local, &key.remote, &key.device)?;
        if let Err(e) = self.send_handshake(identity, key, init, cancel).await {
            self.channels.abort_handshake(key);
            return Err(e);
        }
        Ok(())
    }

    async fn send_on_session(
        &self,
        identity: &LocalIdentity,
        key: &ChannelKey,
        plaintext: &[u8],
        cancel: &CancelToken,
    ) -> EngineResult<MessageId> {
        let revoked = self.dispatch.revocation(key);
        let _turn = tokio::select! {
            turn = self.dispatch.acquire(key) => turn,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let (sequence, ciphertext) = self.sessions.encrypt(key, plaintext)?;
        let session_id = self
            .sessions
            .session_id(key)
            .ok_or(EngineError::SessionNotEstablished)?;
        let outbound = OutboundMessage {
            key: *key,
            sender_device: identity.device,
            sequence: Some(sequence),
            payload: Envelope::Data {
                session_id,
                sequence,
                ciphertext,
            }
            .encode()?,
        };

        let message_id = tokio::select! {
            uploaded = self.server.upload(&outbound, cancel) => uploaded?,
            _ = revoked.cancelled() => {
                warn!(channel = %key, sequence, "Session revoked during upload");
                return Err(EngineError::SessionRevoked);
            }
        };
        info!(channel = %key, sequence, message = %message_id, "Message sent");
        Ok(message_id)
    }

    async fn send_handshake(
        &self,
        identity: &LocalIdentity,
        key: &ChannelKey,
        message: HandshakeMessage,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let step = message.step();
        let outbound = OutboundMessage {
            key: *key,
            sender_device: identity.device,
            sequence: None,
            payload: Envelope::Handshake { message }.encode()?,
        };
        self.server.upload(&outbound, cancel).await?;
        debug!(channel = %key, step, "Handshake message sent");
        Ok(())
    }

    // ─── Inbound ───

    /// Process everything currently in the identity's mailbox; returns the
    /// number of messages delivered to handlers
    pub async fn poll_once(&self, local: &IdentityId, cancel: &CancelToken) -> EngineResult<usize> {
        let identity = self.registry.local_identity(local)?;
        self.sweep_handshakes();

        let mut delivered = 0;
        let inbox = self.server.poll(identity.id(), identity.device, cancel.clone());
        futures_util::pin_mut!(inbox);
        while let Some(item) = inbox.next().await {
            let inbound = item?;
            match self.process_inbound(&identity, &inbound, cancel).await {
                Ok(Some(message)) => {
                    delivered += 1;
                    self.emit_received(&message);
                }
                Ok(None) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => self.drop_inbound(&identity, &inbound, e),
            }
            self.server
                .acknowledge(identity.id(), identity.device, &inbound.message_id, cancel)
                .await?;
        }
        Ok(delivered)
    }

    /// Poll the identity's mailbox until `cancel` fires.
    ///
    /// Transient relay failures are logged and retried on the next tick.
    pub async fn run_inbound(&self, local: &IdentityId, cancel: &CancelToken) -> EngineResult<()> {
        let interval = self.config.relay.poll_interval();
        info!(identity = %local.short(), "Inbound loop started");
        loop {
            match self.poll_once(local, cancel).await {
                Ok(0) => {}
                Ok(delivered) => debug!(delivered, "Delivered messages"),
                Err(EngineError::Cancelled) => break,
                Err(e) if e.is_transient() => warn!(error = %e, "Relay poll failed"),
                Err(e) => {
                    error!(identity = %local.short(), error = %e, "Inbound loop stopped");
                    return Err(e);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(identity = %local.short(), "Inbound loop stopped");
        Ok(())
    }

    fn sweep_handshakes(&self) {
        for key in self.channels.expire_pending() {
            self.dispatch.complete(&key, Err(HandshakeFailure::Timeout));
            self.emit_diagnostic(Diagnostic::HandshakeTimedOut { key });
        }
    }

    async fn process_inbound(
        &self,
        identity: &LocalIdentity,
        inbound: &InboundMessage,
        cancel: &CancelToken,
    ) -> EngineResult<Option<ReceivedMessage>> {
        match Envelope::decode(&inbound.payload)? {
            Envelope::Handshake { message } => {
                self.process_handshake(identity, inbound, message, cancel)
                    .await?;
                Ok(None)
            }
            Envelope::Data {
                session_id,
                sequence,
                ciphertext,
            } => {
                let key = ChannelKey::new(identity.id(), inbound.sender, inbound.sender_device);
                let _turn = tokio::select! {
                    turn = self.dispatch.acquire(&key) => turn,
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                };
                if self.sessions.session_id(&key) != Some(session_id) {
                    return Err(EngineError::SessionNotEstablished);
                }
                let plaintext = self.sessions.decrypt(&key, sequence, &ciphertext)?;
                Ok(Some(ReceivedMessage {
                    local: key.local,
                    sender: key.remote,
                    sender_device: key.device,
                    sequence,
                    plaintext,
                }))
            }
        }
    }

    async fn process_handshake(
        &self,
        identity: &LocalIdentity,
        inbound: &InboundMessage,
        message: HandshakeMessage,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let (remote, device) = message.sender();
        if (remote, device) != (inbound.sender, inbound.sender_device) {
            return Err(EngineError::Protocol(
                "handshake sender does not match relay metadata".into(),
            ));
        }
        let key = ChannelKey::new(identity.id(), remote, device);

        let outcome = match self.channels.handle_handshake_message(&message) {
            Ok(outcome) => outcome,
            Err(e) => {
                if !self.channels.state(&key).is_pending() {
                    self.dispatch.complete(&key, Err(handshake_failure(&e)));
                }
                return Err(e);
            }
        };

        let HandshakeOutcome { key, state, reply } = outcome;
        let established = state == ChannelState::Established;
        if let Some(reply) = reply {
            if let Err(e) = self.send_handshake(identity, &key, reply, cancel).await {
                if established {
                    // The peer never learns of this session; start over
                    self.sessions.remove(&key)?;
                } else {
                    self.channels.abort_handshake(&key);
                }
                self.dispatch.complete(&key, Err(handshake_failure(&e)));
                return Err(e);
            }
        }
        if established {
            self.dispatch.complete(&key, Ok(()));
            self.emit_diagnostic(Diagnostic::ChannelEstablished { key });
        }
        Ok(())
    }

    fn drop_inbound(&self, identity: &LocalIdentity, inbound: &InboundMessage, err: EngineError) {
        let cryptographic = err.is_cryptographic();
        warn!(
            identity = %identity.id().short(),
            sender = %inbound.sender.short(),
            message = %inbound.message_id,
            cryptographic,
            error = %err,
            "Dropped inbound message"
        );
        self.emit_diagnostic(Diagnostic::InboundDropped {
            local: identity.id(),
            sender: inbound.sender,
            sender_device: inbound.sender_device,
            message_id: inbound.message_id.clone(),
            reason: err.to_string(),
            cryptographic,
        });
    }
}

fn handshake_failure(err: &EngineError) -> HandshakeFailure {
    match err {
        EngineError::HandshakeFailed(failure) => failure.clone(),
        EngineError::Timeout => HandshakeFailure::Timeout,
        EngineError::Cancelled => HandshakeFailure::Cancelled,
        EngineError::AuthenticationFailure(_) | EngineError::ContactRevoked => {
            HandshakeFailure::Authentication
        }
        other => HandshakeFailure::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MemoryRelay;
    use std::time::Duration;

    struct Node {
        engine: Arc<Engine>,
        me: LocalIdentity,
    }

    fn node(relay: &Arc<MemoryRelay>) -> Node {
        let engine = Engine::new(EngineConfig::default(), relay.clone()).unwrap();
        let me = engine.create_identity().unwrap();
        Node {
            engine: Arc::new(engine),
            me,
        }
    }

    fn introduce(a: &Node, b: &Node) {
        for (x, y) in [(a, b), (b, a)] {
            x.engine
                .add_contact(&x.me.id(), y.me.public, TrustLevel::Trusted)
                .unwrap();
            x.engine
                .add_contact_device(&x.me.id(), &y.me.id(), y.me.device)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_handshake_by_manual_polling() {
        let relay = Arc::new(MemoryRelay::new());
        let (alice, bob) = (node(&relay), node(&relay));
        introduce(&alice, &bob);
        let cancel = CancelToken::never();

        let sender = alice.engine.clone();
        let (a, b, d) = (alice.me.id(), bob.me.id(), bob.me.device);
        let send = tokio::spawn(async move {
            sender
                .send_message(&a, &b, &d, b"hello", &CancelToken::never())
                .await
        });

        // Drive both mailboxes until the message lands
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = received.clone();
        bob.engine
            .on_message_received(move |m| sink.lock().push(m.plaintext.clone()));
        for _ in 0..50 {
            bob.engine.poll_once(&bob.me.id(), &cancel).await.unwrap();
            alice.engine.poll_once(&alice.me.id(), &cancel).await.unwrap();
            if !received.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        send.await.unwrap().unwrap();
        assert_eq!(received.lock().as_slice(), &[b"hello".to_vec()]);
        assert_eq!(
            alice.engine.channel_state(&a, &b, &d),
            ChannelState::Established
        );
    }

    #[tokio::test]
    async fn test_send_to_revoked_contact() {
        let relay = Arc::new(MemoryRelay::new());
        let (alice, bob) = (node(&relay), node(&relay));
        introduce(&alice, &bob);
        alice
            .engine
            .set_trust(&alice.me.id(), &bob.me.id(), TrustLevel::Revoked)
            .unwrap();

        let result = alice
            .engine
            .send_message(
                &alice.me.id(),
                &bob.me.id(),
                &bob.me.device,
                b"x",
                &CancelToken::never(),
            )
            .await;
        assert!(matches!(result, Err(EngineError::ContactRevoked)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_handshake_times_out() {
        let relay = Arc::new(MemoryRelay::new());
        let (alice, bob) = (node(&relay), node(&relay));
        introduce(&alice, &bob);

        // Nobody polls bob's mailbox
        let result = alice
            .engine
            .send_message(
                &alice.me.id(),
                &bob.me.id(),
                &bob.me.device,
                b"x",
                &CancelToken::never(),
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::HandshakeFailed(HandshakeFailure::Timeout))
        ));
        assert_eq!(
            alice
                .engine
                .channel_state(&alice.me.id(), &bob.me.id(), &bob.me.device),
            ChannelState::NoSession
        );
    }

    #[tokio::test]
    async fn test_garbage_inbound_is_dropped_with_diagnostic() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay);
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        alice.engine.on_diagnostic(move |d| sink.lock().push(d.clone()));

        relay
            .put_message(crate::server::RelayPut {
                sender: IdentityId([7u8; 32]),
                sender_device: DeviceId([7u8; 16]),
                recipient: alice.me.id(),
                device: alice.me.device,
                sequence_hint: None,
                payload: b"not an envelope".to_vec(),
            })
            .await
            .unwrap();

        let delivered = alice
            .engine
            .poll_once(&alice.me.id(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(relay.pending(&alice.me.id(), &alice.me.device), 0);
        assert!(matches!(
            events.lock().as_slice(),
            [Diagnostic::InboundDropped { cryptographic: false, .. }]
        ));
    }

    #[tokio::test]
    async fn test_failed_init_upload_is_a_handshake_failure() {
        let relay = Arc::new(MemoryRelay::new());
        let (alice, bob) = (node(&relay), node(&relay));
        introduce(&alice, &bob);
        relay.fail_next(1, crate::server::RelayError::Rejected("quota".into()));

        let result = alice
            .engine
            .send_message(
                &alice.me.id(),
                &bob.me.id(),
                &bob.me.device,
                b"x",
                &CancelToken::never(),
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::HandshakeFailed(HandshakeFailure::Other(_)))
        ));
        assert_eq!(
            alice
                .engine
                .channel_state(&alice.me.id(), &bob.me.id(), &bob.me.device),
            ChannelState::NoSession
        );
    }

    #[tokio::test]
    async fn test_send_joins_handshake_started_by_peer() {
        let relay = Arc::new(MemoryRelay::new());
        let (alice, bob) = (node(&relay), node(&relay));
        introduce(&alice, &bob);
        let cancel = CancelToken::never();
        let (a, b) = (alice.me.clone(), bob.me.clone());

        let sender = alice.engine.clone();
        let alice_send = tokio::spawn(async move {
            sender
                .send_message(&a.id(), &b.id(), &b.device, b"from alice", &CancelToken::never())
                .await
        });
        for _ in 0..50 {
            bob.engine.poll_once(&bob.me.id(), &cancel).await.unwrap();
            if bob.engine.channel_state(&bob.me.id(), &alice.me.id(), &alice.me.device)
                == ChannelState::HandshakeRespondedTo
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Bob answered alice's Init; his own send has to wait for it
        let sender = bob.engine.clone();
        let (a, b) = (alice.me.clone(), bob.me.clone());
        let bob_send = tokio::spawn(async move {
            sender
                .send_message(&b.id(), &a.id(), &a.device, b"from bob", &CancelToken::never())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bob_send.is_finished());
        // Only the Response waits in alice's mailbox, no second Init
        assert_eq!(relay.pending(&alice.me.id(), &alice.me.device), 1);

        for _ in 0..50 {
            alice.engine.poll_once(&alice.me.id(), &cancel).await.unwrap();
            bob.engine.poll_once(&bob.me.id(), &cancel).await.unwrap();
            if alice_send.is_finished() && bob_send.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        alice_send.await.unwrap().unwrap();
        bob_send.await.unwrap().unwrap();
        assert_eq!(
            bob.engine
                .channel_state(&bob.me.id(), &alice.me.id(), &alice.me.device),
            ChannelState::Established
        );
    }

    #[test]
    fn test_identity_metadata() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = node(&relay);
        alice
            .engine
            .set_identity_metadata(&alice.me.id(), "label", "work")
            .unwrap();
        let stored = alice.engine.local_identity(&alice.me.id()).unwrap();
        assert_eq!(stored.metadata.get("label").map(String::as_str), Some("work"));

        assert!(matches!(
            alice
                .engine
                .set_identity_metadata(&IdentityId([9u8; 32]), "label", "x"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_handshake_failure_mapping() {
        assert_eq!(
            handshake_failure(&EngineError::Timeout),
            HandshakeFailure::Timeout
        );
        assert_eq!(
            handshake_failure(&EngineError::AuthenticationFailure("bad".into())),
            HandshakeFailure::Authentication
        );
        assert!(matches!(
            handshake_failure(&EngineError::Protocol("odd".into())),
            HandshakeFailure::Other(_)
        ));
    }
}
