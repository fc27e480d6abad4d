//! Relay server interface
//!
//! The relay is an untrusted store-and-forward mailbox keyed by
//! (recipient identity, device). It only ever sees opaque payloads.
//!
//! - [`RelayApi`]: the three relay calls (put, get, delete)
//! - [`ServerInterface`]: retry with backoff on top of a relay, lazy polling
//!   and acknowledgement
//! - [`MemoryRelay`]: in-process relay, also used by the relay binary
//! - [`WebSocketRelay`]: client for the `parley-relay` binary

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{DeviceId, IdentityId};

mod cancel;
mod interface;
mod memory;
pub mod websocket;
pub mod wire;

pub use cancel::{CancelHandle, CancelToken};
pub use interface::{InboundMessage, OutboundMessage, ServerInterface};
pub use memory::MemoryRelay;
pub use websocket::WebSocketRelay;
pub use wire::{handle_request, RelayRequest, RelayResponse};

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Relay could not be reached or dropped the connection
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    /// Relay did not answer in time
    #[error("Relay request timed out")]
    Timeout,

    /// Relay refused the request; retrying will not help
    #[error("Relay rejected request: {0}")]
    Rejected(String),
}

impl RelayError {
    /// Worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Unavailable(_) | RelayError::Timeout)
    }
}

/// Result type for relay calls
pub type RelayResult<T> = Result<T, RelayError>;

/// Relay-assigned message id
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to the relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPut {
    /// Sending identity
    pub sender: IdentityId,
    /// Sending device
    pub sender_device: DeviceId,
    /// Recipient identity
    pub recipient: IdentityId,
    /// Recipient device
    pub device: DeviceId,
    /// Sequence number of a data message, for ordering hints only
    pub sequence_hint: Option<u64>,
    /// Opaque payload
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// A message stored at the relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Relay-assigned id
    pub message_id: MessageId,
    /// Sending identity, as reported by the relay
    pub sender: IdentityId,
    /// Sending device, as reported by the relay
    pub sender_device: DeviceId,
    /// Sequence hint supplied by the sender
    pub sequence_hint: Option<u64>,
    /// Opaque payload
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Store-and-forward relay
#[async_trait]
pub trait RelayApi: Send + Sync {
    /// Store a message in the recipient's mailbox
    async fn put_message(&self, message: RelayPut) -> RelayResult<MessageId>;

    /// Fetch every unacknowledged message of a mailbox, oldest first
    async fn get_messages(
        &self,
        recipient: IdentityId,
        device: DeviceId,
    ) -> RelayResult<Vec<RelayEnvelope>>;

    /// Acknowledge (delete) a message. Deleting an unknown id succeeds.
    async fn delete_message(
        &self,
        recipient: IdentityId,
        device: DeviceId,
        message_id: MessageId,
    ) -> RelayResult<()>;
}

/// Serde adapter writing byte payloads as base64 strings
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}
