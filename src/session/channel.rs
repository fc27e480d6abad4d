//! A single established channel session
//!
//! Each direction has its own key, derived from the handshake secret with
//! the sending endpoint as context. Nonces come from the sequence number,
//! and the associated data binds session id, sender and sequence, so a
//! ciphertext is only valid in the one slot it was made for.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::window::ReplayWindow;
use super::{ChannelKey, SessionId, SessionState};
use crate::crypto::{Cipher, DeviceId, Hash, IdentityId};
use crate::error::{EngineError, EngineResult};

const DIRECTION_CONTEXT: &str = "parley-channel-v1 2024 direction key";

/// Symmetric keys of one session
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    send: [u8; 32],
    receive: [u8; 32],
}

impl SessionKeys {
    /// Derive both direction keys from the handshake secret
    pub fn derive(
        secret: &[u8; 32],
        local: (&IdentityId, &DeviceId),
        remote: (&IdentityId, &DeviceId),
    ) -> Self {
        SessionKeys {
            send: direction_key(secret, local.0, local.1),
            receive: direction_key(secret, remote.0, remote.1),
        }
    }

    #[cfg(test)]
    pub(crate) fn send_key(&self) -> &[u8; 32] {
        &self.send
    }

    #[cfg(test)]
    pub(crate) fn receive_key(&self) -> &[u8; 32] {
        &self.receive
    }
}

fn direction_key(secret: &[u8; 32], sender: &IdentityId, device: &DeviceId) -> [u8; 32] {
    let mut material = zeroize::Zeroizing::new(Vec::with_capacity(32 + 32 + 16));
    material.extend_from_slice(secret);
    material.extend_from_slice(sender.as_bytes());
    material.extend_from_slice(device.as_bytes());
    Hash::derive_key(DIRECTION_CONTEXT, &material)
}

/// State of one channel: keys, counters and replay window
pub struct ChannelSession {
    key: ChannelKey,
    local_device: DeviceId,
    session_id: SessionId,
    keys: Option<SessionKeys>,
    next_send: u64,
    window: ReplayWindow,
    state: SessionState,
    created_at: u64,
}

impl ChannelSession {
    /// A fresh session as produced by a completed handshake
    pub fn new(
        key: ChannelKey,
        local_device: DeviceId,
        session_id: SessionId,
        keys: SessionKeys,
        window_size: u64,
        created_at: u64,
    ) -> Self {
        ChannelSession {
            key,
            local_device,
            session_id,
            keys: Some(keys),
            next_send: 0,
            window: ReplayWindow::new(window_size),
            state: SessionState::Established,
            created_at,
        }
    }

    /// Channel this session belongs to
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Transcript-derived session id
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Next sequence number to be sent
    pub fn next_send(&self) -> u64 {
        self.next_send
    }

    /// Creation time (seconds since the Unix epoch)
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Expire the session once it is `max_age` seconds old at `now`;
    /// returns whether it expired on this call
    pub(crate) fn expire_if_older(&mut self, max_age: u64, now: u64) -> bool {
        if self.state != SessionState::Established
            || now.saturating_sub(self.created_at) < max_age
        {
            return false;
        }
        self.state = SessionState::Expired;
        true
    }

    /// Seal `plaintext` under the next sequence number.
    ///
    /// Once `rekey_after` messages were sent the session expires instead.
    pub(crate) fn encrypt(
        &mut self,
        plaintext: &[u8],
        rekey_after: u64,
    ) -> EngineResult<(u64, Vec<u8>)> {
        match self.state {
            SessionState::Established => {}
            SessionState::Revoked => return Err(EngineError::SessionRevoked),
            SessionState::Expired => return Err(EngineError::SessionNotEstablished),
        }
        if self.next_send >= rekey_after {
            self.state = SessionState::Expired;
            return Err(EngineError::SessionNotEstablished);
        }
        let keys = self.keys.as_ref().ok_or(EngineError::SessionNotEstablished)?;

        let sequence = self.next_send;
        let aad = self.aad(&self.key.local, &self.local_device, sequence);
        let ciphertext = Cipher::seal(&keys.send, &Cipher::counter_nonce(sequence), plaintext, &aad)?;
        self.next_send += 1;
        Ok((sequence, ciphertext))
    }

    /// Open a received ciphertext.
    ///
    /// A failed open leaves the window untouched, so the sequence can still
    /// be delivered by its genuine sender.
    pub(crate) fn decrypt(&mut self, sequence: u64, ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        if self.state == SessionState::Revoked {
            return Err(EngineError::SessionRevoked);
        }
        let keys = self.keys.as_ref().ok_or(EngineError::SessionNotEstablished)?;
        self.window.check(sequence)?;

        let aad = self.aad(&self.key.remote, &self.key.device, sequence);
        let plaintext = Cipher::open(
            &keys.receive,
            &Cipher::counter_nonce(sequence),
            ciphertext,
            &aad,
        )
        .map_err(|_| EngineError::DecryptionFailure)?;

        self.window.accept(sequence);
        Ok(plaintext)
    }

    /// Revoke and zeroize keys
    pub(crate) fn revoke(&mut self) {
        self.state = SessionState::Revoked;
        self.keys = None;
    }

    fn aad(&self, sender: &IdentityId, device: &DeviceId, sequence: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(32 + 32 + 16 + 8);
        aad.extend_from_slice(self.session_id.as_bytes());
        aad.extend_from_slice(sender.as_bytes());
        aad.extend_from_slice(device.as_bytes());
        aad.extend_from_slice(&sequence.to_be_bytes());
        aad
    }

    pub(crate) fn to_record(&self) -> SessionRecord {
        SessionRecord {
            key: self.key,
            local_device: self.local_device,
            session_id: self.session_id,
            send_key: self.keys.as_ref().map(|k| k.send),
            receive_key: self.keys.as_ref().map(|k| k.receive),
            next_send: self.next_send,
            window: self.window.clone(),
            state: self.state,
            created_at: self.created_at,
        }
    }

    pub(crate) fn from_record(record: &SessionRecord) -> Self {
        let keys = match (record.send_key, record.receive_key) {
            (Some(send), Some(receive)) if record.state != SessionState::Revoked => {
                Some(SessionKeys { send, receive })
            }
            _ => None,
        };
        ChannelSession {
            key: record.key,
            local_device: record.local_device,
            session_id: record.session_id,
            state: if keys.is_some() {
                record.state
            } else {
                SessionState::Revoked
            },
            keys,
            next_send: record.next_send,
            window: record.window.clone(),
            created_at: record.created_at,
        }
    }
}

/// Persisted form of a session, only ever written sealed
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionRecord {
    #[zeroize(skip)]
    key: ChannelKey,
    #[zeroize(skip)]
    local_device: DeviceId,
    #[zeroize(skip)]
    session_id: SessionId,
    send_key: Option<[u8; 32]>,
    receive_key: Option<[u8; 32]>,
    next_send: u64,
    #[zeroize(skip)]
    window: ReplayWindow,
    #[zeroize(skip)]
    state: SessionState,
    created_at: u64,
}

impl SessionRecord {
    pub(crate) fn key(&self) -> &ChannelKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ChannelSession, ChannelSession) {
        let alice = (IdentityId([1u8; 32]), DeviceId([1u8; 16]));
        let bob = (IdentityId([2u8; 32]), DeviceId([2u8; 16]));
        let secret = [7u8; 32];
        let id = SessionId([9u8; 32]);

        let a = ChannelSession::new(
            ChannelKey::new(alice.0, bob.0, bob.1),
            alice.1,
            id,
            SessionKeys::derive(&secret, (&alice.0, &alice.1), (&bob.0, &bob.1)),
            64,
            0,
        );
        let b = ChannelSession::new(
            ChannelKey::new(bob.0, alice.0, alice.1),
            bob.1,
            id,
            SessionKeys::derive(&secret, (&bob.0, &bob.1), (&alice.0, &alice.1)),
            64,
            0,
        );
        (a, b)
    }

    #[test]
    fn test_direction_keys_mirror() {
        let (a, b) = pair();
        let (ak, bk) = (a.keys.as_ref().unwrap(), b.keys.as_ref().unwrap());
        assert_eq!(ak.send_key(), bk.receive_key());
        assert_eq!(ak.receive_key(), bk.send_key());
        assert_ne!(ak.send_key(), ak.receive_key());
    }

    #[test]
    fn test_encrypt_decrypt_both_ways() {
        let (mut a, mut b) = pair();

        let (seq, ct) = a.encrypt(b"hello", 100).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(b.decrypt(seq, &ct).unwrap(), b"hello");

        let (seq, ct) = b.encrypt(b"hi back", 100).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(a.decrypt(seq, &ct).unwrap(), b"hi back");
    }

    #[test]
    fn test_own_ciphertext_does_not_open_locally() {
        let (mut a, _) = pair();
        let (seq, ct) = a.encrypt(b"loop", 100).unwrap();
        assert!(matches!(a.decrypt(seq, &ct), Err(EngineError::DecryptionFailure)));
    }

    #[test]
    fn test_wrong_sequence_fails_without_consuming() {
        let (mut a, mut b) = pair();
        let (seq, ct) = a.encrypt(b"hello", 100).unwrap();

        assert!(matches!(b.decrypt(seq + 1, &ct), Err(EngineError::DecryptionFailure)));
        assert_eq!(b.decrypt(seq, &ct).unwrap(), b"hello");
        assert!(matches!(b.decrypt(seq, &ct), Err(EngineError::ReplayDetected)));
    }

    #[test]
    fn test_expiry() {
        let (mut a, _) = pair();
        a.encrypt(b"1", 2).unwrap();
        a.encrypt(b"2", 2).unwrap();
        assert!(matches!(a.encrypt(b"3", 2), Err(EngineError::SessionNotEstablished)));
        assert_eq!(a.state(), SessionState::Expired);
    }

    #[test]
    fn test_expires_with_age() {
        let (mut a, _) = pair();
        assert!(!a.expire_if_older(100, 99));
        a.encrypt(b"young", 100).unwrap();

        assert!(a.expire_if_older(100, 100));
        assert!(!a.expire_if_older(100, 200));
        assert_eq!(a.state(), SessionState::Expired);
        assert!(matches!(a.encrypt(b"old", 100), Err(EngineError::SessionNotEstablished)));
    }

    #[test]
    fn test_revoke_drops_keys() {
        let (mut a, _) = pair();
        a.revoke();
        assert!(a.keys.is_none());
        assert!(matches!(a.encrypt(b"x", 100), Err(EngineError::SessionRevoked)));
        assert!(matches!(a.decrypt(0, b"x"), Err(EngineError::SessionRevoked)));
    }

    #[test]
    fn test_record_roundtrip_keeps_counters() {
        let (mut a, mut b) = pair();
        let (_, ct0) = a.encrypt(b"zero", 100).unwrap();
        b.decrypt(0, &ct0).unwrap();

        let mut restored = ChannelSession::from_record(&b.to_record());
        assert!(matches!(restored.decrypt(0, &ct0), Err(EngineError::ReplayDetected)));

        let (seq, ct1) = a.encrypt(b"one", 100).unwrap();
        assert_eq!(restored.decrypt(seq, &ct1).unwrap(), b"one");

        let a_restored = ChannelSession::from_record(&a.to_record());
        assert_eq!(a_restored.next_send(), 2);
    }
}
