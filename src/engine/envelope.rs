//! What goes inside a relay payload

use serde::{Deserialize, Serialize};

use crate::channel::HandshakeMessage;
use crate::error::{EngineError, EngineResult};
use crate::session::SessionId;

/// Relay payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Channel establishment traffic
    Handshake {
        /// The handshake message
        message: HandshakeMessage,
    },
    /// An encrypted application message
    Data {
        /// Session the ciphertext belongs to
        session_id: SessionId,
        /// Sender's sequence number
        sequence: u64,
        /// Ciphertext with tag
        #[serde(with = "crate::server::base64_bytes")]
        ciphertext: Vec<u8>,
    },
}

impl Envelope {
    /// Serialize for upload
    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    /// Parse a downloaded payload
    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Protocol(format!("malformed envelope: {e}")))
    }
}
