//! Session table
//!
//! Holds the established sessions produced by completed handshakes, one per
//! channel, and performs all message encryption and decryption. Every
//! mutation that moves a counter is written to storage before its result is
//! returned, so a restart can never reuse a sequence number.

mod channel;
mod window;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use channel::{ChannelSession, SessionKeys};
pub use window::ReplayWindow;

use crate::config::SessionConfig;
use crate::crypto::{DeviceId, IdentityId};
use crate::error::{EngineError, EngineResult};
use crate::registry::unix_now;
use crate::storage::{SealedStore, StorageError};
use channel::SessionRecord;

const NAMESPACE: &str = "sessions";

/// Size of a session id in bytes
pub const SESSION_ID_SIZE: usize = 32;

/// Identifier of one completed handshake, shared by both ends
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; SESSION_ID_SIZE]);

impl_hex_bytes!(SessionId, SESSION_ID_SIZE);

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({}...)", &self.to_hex()[..12])
    }
}

/// Addresses one channel: a local identity talking to one device of a
/// remote identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Our identity
    pub local: IdentityId,
    /// Remote identity
    pub remote: IdentityId,
    /// Remote device
    pub device: DeviceId,
}

impl ChannelKey {
    /// Build a channel key
    pub fn new(local: IdentityId, remote: IdentityId, device: DeviceId) -> Self {
        ChannelKey {
            local,
            remote,
            device,
        }
    }

    fn storage_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.local.to_hex(),
            self.remote.to_hex(),
            self.device.to_hex()
        )
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{}/{}",
            self.local.short(),
            self.remote.short(),
            &self.device.to_hex()[..8]
        )
    }
}

/// Lifecycle of an installed session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Usable in both directions
    Established,
    /// Revoked; keys are gone
    Revoked,
    /// Send limit reached; receiving still works until replaced
    Expired,
}

/// All sessions of this engine
pub struct SessionTable {
    store: SealedStore,
    config: SessionConfig,
    sessions: RwLock<HashMap<ChannelKey, Arc<Mutex<ChannelSession>>>>,
}

impl SessionTable {
    /// Open the table and load persisted sessions.
    ///
    /// A record that fails to unseal is discarded; its channel falls back to
    /// no session and re-handshakes on next use.
    pub fn open(store: SealedStore, config: SessionConfig) -> EngineResult<Self> {
        let mut sessions = HashMap::new();
        for name in store.list(NAMESPACE)? {
            match store.get::<SessionRecord>(NAMESPACE, &name) {
                Ok(Some(record)) => {
                    let session = ChannelSession::from_record(&record);
                    sessions.insert(*record.key(), Arc::new(Mutex::new(session)));
                }
                Ok(None) => {}
                Err(StorageError::Corrupted { .. }) => {
                    warn!(record = %name, "Discarding unreadable session record");
                    store.delete(NAMESPACE, &name)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(sessions = sessions.len(), "Opened session table");
        Ok(SessionTable {
            store,
            config,
            sessions: RwLock::new(sessions),
        })
    }

    /// Volatile session table
    pub fn in_memory(config: SessionConfig) -> EngineResult<Self> {
        Self::open(SealedStore::in_memory()?, config)
    }

    /// Configuration in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Install a session from a completed handshake, replacing any previous
    /// session of the channel
    pub fn install(&self, session: ChannelSession) -> EngineResult<()> {
        let key = *session.key();
        self.store
            .put(NAMESPACE, &key.storage_name(), &session.to_record())?;
        self.sessions
            .write()
            .insert(key, Arc::new(Mutex::new(session)));
        info!(channel = %key, "Session installed");
        Ok(())
    }

    /// Encrypt under the channel's session.
    ///
    /// Returns the sequence number assigned to this message.
    pub fn encrypt(&self, key: &ChannelKey, plaintext: &[u8]) -> EngineResult<(u64, Vec<u8>)> {
        self.encrypt_at(key, plaintext, unix_now())
    }

    /// [`SessionTable::encrypt`] at an explicit time (seconds since the
    /// Unix epoch)
    pub fn encrypt_at(
        &self,
        key: &ChannelKey,
        plaintext: &[u8],
        now: u64,
    ) -> EngineResult<(u64, Vec<u8>)> {
        let entry = self.entry(key).ok_or(EngineError::SessionNotEstablished)?;
        let mut session = entry.lock();

        if session.expire_if_older(self.config.rekey_after_secs, now) {
            info!(channel = %key, "Session reached its age limit");
        }
        let result = session.encrypt(plaintext, self.config.rekey_after_messages);
        let expired = result.is_err() && session.state() == SessionState::Expired;
        if result.is_ok() || expired {
            self.persist(key, &session)?;
        }

        if let Ok((sequence, _)) = &result {
            debug!(channel = %key, sequence, "Encrypted message");
        } else if expired {
            info!(channel = %key, "Session expired, re-handshake required");
        }
        result
    }

    /// Decrypt a message received on the channel
    pub fn decrypt(
        &self,
        key: &ChannelKey,
        sequence: u64,
        ciphertext: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let entry = self.entry(key).ok_or(EngineError::SessionNotEstablished)?;
        let mut session = entry.lock();

        let plaintext = session.decrypt(sequence, ciphertext)?;
        self.persist(key, &session)?;
        debug!(channel = %key, sequence, "Decrypted message");
        Ok(plaintext)
    }

    /// Revoke the channel's session; its keys are zeroized
    pub fn revoke(&self, key: &ChannelKey) -> EngineResult<()> {
        let entry = self
            .entry(key)
            .ok_or_else(|| EngineError::NotFound(format!("session {key}")))?;
        let mut session = entry.lock();
        session.revoke();
        self.persist(key, &session)?;
        info!(channel = %key, "Session revoked");
        Ok(())
    }

    /// Lifecycle state, `None` when no session was ever installed
    pub fn state(&self, key: &ChannelKey) -> Option<SessionState> {
        self.entry(key).map(|entry| entry.lock().state())
    }

    /// Id of the channel's current session
    pub fn session_id(&self, key: &ChannelKey) -> Option<SessionId> {
        self.entry(key).map(|entry| *entry.lock().session_id())
    }

    /// Channels of a local identity with a given remote identity
    pub fn channels_with(&self, local: &IdentityId, remote: &IdentityId) -> Vec<ChannelKey> {
        self.sessions
            .read()
            .keys()
            .filter(|k| &k.local == local && &k.remote == remote)
            .copied()
            .collect()
    }

    /// Drop a channel's session entirely
    pub fn remove(&self, key: &ChannelKey) -> EngineResult<()> {
        self.sessions.write().remove(key);
        self.store.delete(NAMESPACE, &key.storage_name())?;
        Ok(())
    }

    /// Drop every session of a local identity
    pub fn remove_local(&self, local: &IdentityId) -> EngineResult<()> {
        let keys: Vec<_> = self
            .sessions
            .read()
            .keys()
            .filter(|k| &k.local == local)
            .copied()
            .collect();
        for key in keys {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Drop every session between a local and a remote identity
    pub fn remove_remote(&self, local: &IdentityId, remote: &IdentityId) -> EngineResult<()> {
        for key in self.channels_with(local, remote) {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn entry(&self, key: &ChannelKey) -> Option<Arc<Mutex<ChannelSession>>> {
        self.sessions.read().get(key).cloned()
    }

    fn persist(&self, key: &ChannelKey, session: &ChannelSession) -> EngineResult<()> {
        self.store
            .put(NAMESPACE, &key.storage_name(), &session.to_record())?;
        Ok(())
    }
}
