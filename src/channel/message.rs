//! Handshake messages and their transcripts
//!
//! Three messages establish a channel:
//!
//! ```text
//! Initiator                                   Responder
//!   Init     { ephemeral_i, sig_i(T1) }   ──►
//!            ◄──   Response { ephemeral_r, sig_r(T2), mac_r }
//!   Confirm  { mac_i }                    ──►
//! ```
//!
//! `T1` binds both identities, both devices, the handshake id and the
//! initiator's ephemeral key. `T2` extends `T1` with the responder's
//! ephemeral key. The key-confirmation MACs prove possession of the
//! derived secret.

use serde::{Deserialize, Serialize};

use crate::crypto::{
    AgreementPublicKey, DeviceId, Hash, HashOutput, IdentityId, PublicIdentity, SignatureBytes,
};

/// Handshake wire version
pub const PROTOCOL_VERSION: u8 = 1;

/// Context string mixed into every handshake derivation
pub const PROTOCOL_CONTEXT: &str = "parley-channel-v1";

/// Size of a handshake id in bytes
pub const HANDSHAKE_ID_SIZE: usize = 16;

/// Size of a key-confirmation MAC in bytes
pub const MAC_SIZE: usize = 32;

/// Random id shared by the messages of one handshake attempt
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeId(pub [u8; HANDSHAKE_ID_SIZE]);

impl_hex_bytes!(HandshakeId, HANDSHAKE_ID_SIZE);

impl std::fmt::Debug for HandshakeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandshakeId({})", &self.to_hex()[..8])
    }
}

/// Key-confirmation MAC
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationMac(pub [u8; MAC_SIZE]);

impl_hex_bytes!(ConfirmationMac, MAC_SIZE);

impl std::fmt::Debug for ConfirmationMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConfirmationMac(..)")
    }
}

/// First message, initiator to responder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    /// Wire version
    pub version: u8,
    /// Handshake attempt id
    pub handshake_id: HandshakeId,
    /// Initiator public identity
    pub sender: PublicIdentity,
    /// Initiator device
    pub sender_device: DeviceId,
    /// Responder identity
    pub recipient: IdentityId,
    /// Responder device
    pub recipient_device: DeviceId,
    /// Initiator ephemeral key
    pub ephemeral: AgreementPublicKey,
    /// Initiator signature over the init transcript
    pub signature: SignatureBytes,
}

impl InitMessage {
    /// Transcript hash `T1`
    pub fn transcript(&self) -> HashOutput {
        init_transcript(
            &self.handshake_id,
            &self.sender,
            &self.sender_device,
            &self.recipient,
            &self.recipient_device,
            &self.ephemeral,
        )
    }
}

/// Second message, responder to initiator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Wire version
    pub version: u8,
    /// Handshake attempt id, echoed from `Init`
    pub handshake_id: HandshakeId,
    /// Responder identity
    pub sender: IdentityId,
    /// Responder device
    pub sender_device: DeviceId,
    /// Initiator identity
    pub recipient: IdentityId,
    /// Initiator device
    pub recipient_device: DeviceId,
    /// Responder ephemeral key
    pub ephemeral: AgreementPublicKey,
    /// Responder signature over the response transcript
    pub signature: SignatureBytes,
    /// Responder key confirmation
    pub confirmation: ConfirmationMac,
}

/// Third message, initiator to responder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmMessage {
    /// Wire version
    pub version: u8,
    /// Handshake attempt id
    pub handshake_id: HandshakeId,
    /// Initiator identity
    pub sender: IdentityId,
    /// Initiator device
    pub sender_device: DeviceId,
    /// Responder identity
    pub recipient: IdentityId,
    /// Responder device
    pub recipient_device: DeviceId,
    /// Initiator key confirmation
    pub confirmation: ConfirmationMac,
}

/// Any handshake message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// See [`InitMessage`]
    Init(InitMessage),
    /// See [`ResponseMessage`]
    Response(ResponseMessage),
    /// See [`ConfirmMessage`]
    Confirm(ConfirmMessage),
}

impl HandshakeMessage {
    /// Handshake attempt id
    pub fn handshake_id(&self) -> &HandshakeId {
        match self {
            HandshakeMessage::Init(m) => &m.handshake_id,
            HandshakeMessage::Response(m) => &m.handshake_id,
            HandshakeMessage::Confirm(m) => &m.handshake_id,
        }
    }

    /// Wire version
    pub fn version(&self) -> u8 {
        match self {
            HandshakeMessage::Init(m) => m.version,
            HandshakeMessage::Response(m) => m.version,
            HandshakeMessage::Confirm(m) => m.version,
        }
    }

    /// Identity and device that sent the message
    pub fn sender(&self) -> (IdentityId, DeviceId) {
        match self {
            HandshakeMessage::Init(m) => (m.sender.id(), m.sender_device),
            HandshakeMessage::Response(m) => (m.sender, m.sender_device),
            HandshakeMessage::Confirm(m) => (m.sender, m.sender_device),
        }
    }

    /// Identity and device the message is addressed to
    pub fn recipient(&self) -> (IdentityId, DeviceId) {
        match self {
            HandshakeMessage::Init(m) => (m.recipient, m.recipient_device),
            HandshakeMessage::Response(m) => (m.recipient, m.recipient_device),
            HandshakeMessage::Confirm(m) => (m.recipient, m.recipient_device),
        }
    }

    /// Short step name for logs
    pub fn step(&self) -> &'static str {
        match self {
            HandshakeMessage::Init(_) => "init",
            HandshakeMessage::Response(_) => "response",
            HandshakeMessage::Confirm(_) => "confirm",
        }
    }
}

/// Transcript hash `T1` from its parts
pub(crate) fn init_transcript(
    handshake_id: &HandshakeId,
    sender: &PublicIdentity,
    sender_device: &DeviceId,
    recipient: &IdentityId,
    recipient_device: &DeviceId,
    ephemeral: &AgreementPublicKey,
) -> HashOutput {
    Hash::hash_fields(
        "parley-channel-v1 2024 init transcript",
        &[
            &[PROTOCOL_VERSION],
            handshake_id.as_bytes(),
            sender.signing.as_bytes(),
            sender.agreement.as_bytes(),
            sender_device.as_bytes(),
            recipient.as_bytes(),
            recipient_device.as_bytes(),
            ephemeral.as_bytes(),
        ],
    )
}

/// Transcript hash `T2`
pub(crate) fn response_transcript(
    init_transcript: &HashOutput,
    responder: &PublicIdentity,
    responder_ephemeral: &AgreementPublicKey,
) -> HashOutput {
    Hash::hash_fields(
        "parley-channel-v1 2024 response transcript",
        &[
            init_transcript,
            responder.signing.as_bytes(),
            responder.agreement.as_bytes(),
            responder_ephemeral.as_bytes(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgreementSecret, SigningSecret};

    fn identity(seed: u8) -> PublicIdentity {
        PublicIdentity {
            signing: *SigningSecret::from_bytes([seed; 32]).public_key(),
            agreement: *AgreementSecret::from_bytes([seed; 32]).public_key(),
        }
    }

    #[test]
    fn test_init_transcript_binds_fields() {
        let alice = identity(1);
        let bob = identity(2);
        let base = init_transcript(
            &HandshakeId([0u8; 16]),
            &alice,
            &DeviceId([1u8; 16]),
            &bob.id(),
            &DeviceId([2u8; 16]),
            &bob.agreement,
        );

        let other_device = init_transcript(
            &HandshakeId([0u8; 16]),
            &alice,
            &DeviceId([3u8; 16]),
            &bob.id(),
            &DeviceId([2u8; 16]),
            &bob.agreement,
        );
        let other_id = init_transcript(
            &HandshakeId([1u8; 16]),
            &alice,
            &DeviceId([1u8; 16]),
            &bob.id(),
            &DeviceId([2u8; 16]),
            &bob.agreement,
        );
        assert_ne!(base, other_device);
        assert_ne!(base, other_id);
    }

    #[test]
    fn test_message_json_is_tagged() {
        let alice = identity(1);
        let msg = HandshakeMessage::Confirm(ConfirmMessage {
            version: PROTOCOL_VERSION,
            handshake_id: HandshakeId([4u8; 16]),
            sender: alice.id(),
            sender_device: DeviceId([1u8; 16]),
            recipient: identity(2).id(),
            recipient_device: DeviceId([2u8; 16]),
            confirmation: ConfirmationMac([5u8; 32]),
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"step\":\"confirm\""));
        let back: HandshakeMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.sender(), (alice.id(), DeviceId([1u8; 16])));
        assert_eq!(back.step(), "confirm");
    }
}
