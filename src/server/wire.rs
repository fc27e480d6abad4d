//! Relay wire protocol
//!
//! One JSON text frame per request and one per response, in order, on a
//! WebSocket connection. Payload bytes travel base64-encoded.

use serde::{Deserialize, Serialize};

use super::{MessageId, RelayApi, RelayEnvelope, RelayError, RelayPut};
use crate::crypto::{DeviceId, IdentityId};

/// Client to relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[allow(missing_docs)]
pub enum RelayRequest {
    /// Store a message
    Put(RelayPut),
    /// Fetch a mailbox
    Get { recipient: IdentityId, device: DeviceId },
    /// Acknowledge a message
    Delete {
        recipient: IdentityId,
        device: DeviceId,
        message_id: MessageId,
    },
    /// Liveness check
    Ping,
}

/// Relay to client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[allow(missing_docs)]
pub enum RelayResponse {
    /// Message stored
    Stored { message_id: MessageId },
    /// Mailbox contents
    Messages { messages: Vec<RelayEnvelope> },
    /// Message deleted
    Deleted,
    /// Request failed; `transient` tells the client whether to retry
    Error { message: String, transient: bool },
    /// Liveness answer
    Pong,
}

impl From<RelayError> for RelayResponse {
    fn from(err: RelayError) -> Self {
        RelayResponse::Error {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl RelayResponse {
    /// Turn an `Error` response into a [`RelayError`]
    pub fn into_result(self) -> Result<RelayResponse, RelayError> {
        match self {
            RelayResponse::Error {
                message,
                transient: true,
            } => Err(RelayError::Unavailable(message)),
            RelayResponse::Error {
                message,
                transient: false,
            } => Err(RelayError::Rejected(message)),
            other => Ok(other),
        }
    }
}

/// Answer one request against a relay backend
pub async fn handle_request(relay: &dyn RelayApi, request: RelayRequest) -> RelayResponse {
    let result = match request {
        RelayRequest::Put(put) => relay
            .put_message(put)
            .await
            .map(|message_id| RelayResponse::Stored { message_id }),
        RelayRequest::Get { recipient, device } => relay
            .get_messages(recipient, device)
            .await
            .map(|messages| RelayResponse::Messages { messages }),
        RelayRequest::Delete {
            recipient,
            device,
            message_id,
        } => relay
            .delete_message(recipient, device, message_id)
            .await
            .map(|_| RelayResponse::Deleted),
        RelayRequest::Ping => Ok(RelayResponse::Pong),
    };
    result.unwrap_or_else(RelayResponse::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MemoryRelay;

    #[test]
    fn test_request_json_shape() {
        let request = RelayRequest::Get {
            recipient: IdentityId([1u8; 32]),
            device: DeviceId([2u8; 16]),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.starts_with("{\"type\":\"Get\",\"data\":{"));
        assert_eq!(serde_json::from_str::<RelayRequest>(&json).unwrap(), request);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let response = RelayResponse::from(RelayError::Rejected("too large".into()));
        let json = serde_json::to_string(&response).unwrap();
        let back: RelayResponse = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.into_result(), Err(RelayError::Rejected(_))));
        assert_eq!(RelayResponse::Pong.into_result(), Ok(RelayResponse::Pong));
    }

    #[tokio::test]
    async fn test_handle_request_against_memory_relay() {
        let relay = MemoryRelay::new();
        let (recipient, device) = (IdentityId([1u8; 32]), DeviceId([1u8; 16]));
        let put = RelayPut {
            sender: IdentityId([2u8; 32]),
            sender_device: DeviceId([2u8; 16]),
            recipient,
            device,
            sequence_hint: Some(3),
            payload: vec![1, 2, 3],
        };

        let RelayResponse::Stored { message_id } =
            handle_request(&relay, RelayRequest::Put(put)).await
        else {
            panic!("expected Stored");
        };

        match handle_request(&relay, RelayRequest::Get { recipient, device }).await {
            RelayResponse::Messages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].sequence_hint, Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }

        let deleted = handle_request(
            &relay,
            RelayRequest::Delete {
                recipient,
                device,
                message_id,
            },
        )
        .await;
        assert_eq!(deleted, RelayResponse::Deleted);
        assert_eq!(relay.pending(&recipient, &device), 0);

        relay.fail_next(1, RelayError::Timeout);
        let failed = handle_request(&relay, RelayRequest::Get { recipient, device }).await;
        assert!(matches!(failed, RelayResponse::Error { transient: true, .. }));
    }
}
