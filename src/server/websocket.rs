//! WebSocket relay client and connection handler
//!
//! The client keeps one connection and reconnects lazily after a failure.
//! Requests are answered in order, so a single in-flight request per
//! connection is enough. A request abandoned mid-exchange takes its
//! connection with it, so a late response can never answer the next request.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::wire::{handle_request, RelayRequest, RelayResponse};
use super::{MessageId, RelayApi, RelayEnvelope, RelayError, RelayPut, RelayResult};
use crate::crypto::{DeviceId, IdentityId};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay reached over WebSocket
pub struct WebSocketRelay {
    url: String,
    conn: Mutex<Option<ClientStream>>,
}

impl WebSocketRelay {
    /// Connect now, failing fast if the relay is down
    pub async fn connect(url: impl Into<String>) -> RelayResult<Self> {
        let url = url.into();
        let ws = open(&url).await?;
        Ok(WebSocketRelay {
            url,
            conn: Mutex::new(Some(ws)),
        })
    }

    /// Connect on first use
    pub fn lazy(url: impl Into<String>) -> Self {
        WebSocketRelay {
            url: url.into(),
            conn: Mutex::new(None),
        }
    }

    /// Relay URL
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, request: RelayRequest) -> RelayResult<RelayResponse> {
        let mut conn = self.conn.lock().await;
        // Checked out for the exchange; only returned once the response is read
        let mut ws = match conn.take() {
            Some(ws) => ws,
            None => open(&self.url).await?,
        };
        let response = exchange(&mut ws, &request).await?;
        *conn = Some(ws);
        response.into_result()
    }
}

async fn open(url: &str) -> RelayResult<ClientStream> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| RelayError::Unavailable(e.to_string()))?;
    debug!(url, "Connected to relay");
    Ok(ws)
}

async fn exchange(ws: &mut ClientStream, request: &RelayRequest) -> RelayResult<RelayResponse> {
    let json =
        serde_json::to_string(request).map_err(|e| RelayError::Rejected(e.to_string()))?;
    ws.send(Message::Text(json))
        .await
        .map_err(|e| RelayError::Unavailable(e.to_string()))?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|e| RelayError::Unavailable(format!("malformed response: {e}")));
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(RelayError::Unavailable("connection closed".into()));
            }
            Some(Err(e)) => return Err(RelayError::Unavailable(e.to_string())),
            Some(Ok(_)) => continue,
        }
    }
}

fn unexpected(response: RelayResponse) -> RelayError {
    RelayError::Rejected(format!("unexpected relay response: {response:?}"))
}

#[async_trait]
impl RelayApi for WebSocketRelay {
    async fn put_message(&self, message: RelayPut) -> RelayResult<MessageId> {
        match self.request(RelayRequest::Put(message)).await? {
            RelayResponse::Stored { message_id } => Ok(message_id),
            other => Err(unexpected(other)),
        }
    }

    async fn get_messages(
        &self,
        recipient: IdentityId,
        device: DeviceId,
    ) -> RelayResult<Vec<RelayEnvelope>> {
        match self.request(RelayRequest::Get { recipient, device }).await? {
            RelayResponse::Messages { messages } => Ok(messages),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_message(
        &self,
        recipient: IdentityId,
        device: DeviceId,
        message_id: MessageId,
    ) -> RelayResult<()> {
        let request = RelayRequest::Delete {
            recipient,
            device,
            message_id,
        };
        match self.request(request).await? {
            RelayResponse::Deleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Serve relay requests on one accepted TCP connection until it closes
pub async fn serve_connection(stream: TcpStream, addr: SocketAddr, relay: Arc<dyn RelayApi>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    info!("New connection from: {}", addr);

    let (mut write, mut read) = ws_stream.split();
    while let Some(frame) = read.next().await {
        let response = match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<RelayRequest>(&text) {
                Ok(request) => handle_request(relay.as_ref(), request).await,
                Err(e) => {
                    warn!("Invalid request from {}: {}", addr, e);
                    RelayResponse::from(RelayError::Rejected(format!("invalid request: {e}")))
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!("WebSocket error from {}: {}", addr, e);
                break;
            }
        };

        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode response for {}: {}", addr, e);
                break;
            }
        };
        if write.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
    info!("Client {} disconnected", addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MemoryRelay;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_relay() -> (String, Arc<MemoryRelay>) {
        let relay = Arc::new(MemoryRelay::new());
        (serve(relay.clone()).await, relay)
    }

    async fn serve(backend: Arc<dyn RelayApi>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, peer, backend.clone()));
            }
        });
        format!("ws://{addr}")
    }

    /// Backend that takes its time storing messages
    struct SlowPuts(MemoryRelay);

    #[async_trait]
    impl RelayApi for SlowPuts {
        async fn put_message(&self, message: RelayPut) -> RelayResult<MessageId> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.0.put_message(message).await
        }

        async fn get_messages(
            &self,
            recipient: IdentityId,
            device: DeviceId,
        ) -> RelayResult<Vec<RelayEnvelope>> {
            self.0.get_messages(recipient, device).await
        }

        async fn delete_message(
            &self,
            recipient: IdentityId,
            device: DeviceId,
            message_id: MessageId,
        ) -> RelayResult<()> {
            self.0.delete_message(recipient, device, message_id).await
        }
    }

    fn put(payload: &[u8]) -> RelayPut {
        RelayPut {
            sender: IdentityId([2u8; 32]),
            sender_device: DeviceId([2u8; 16]),
            recipient: IdentityId([1u8; 32]),
            device: DeviceId([1u8; 16]),
            sequence_hint: None,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_through_socket() {
        let (url, backend) = spawn_relay().await;
        let client = WebSocketRelay::connect(url).await.unwrap();
        let (recipient, device) = (IdentityId([1u8; 32]), DeviceId([1u8; 16]));

        let id = client
            .put_message(RelayPut {
                sender: IdentityId([2u8; 32]),
                sender_device: DeviceId([2u8; 16]),
                recipient,
                device,
                sequence_hint: None,
                payload: b"sealed bytes".to_vec(),
            })
            .await
            .unwrap();

        let messages = client.get_messages(recipient, device).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"sealed bytes");

        client.delete_message(recipient, device, id).await.unwrap();
        assert_eq!(backend.pending(&recipient, &device), 0);
    }

    #[tokio::test]
    async fn test_backend_errors_cross_the_wire() {
        let (url, backend) = spawn_relay().await;
        let client = WebSocketRelay::lazy(url);
        backend.fail_next(1, RelayError::Rejected("quota".into()));

        let err = client
            .get_messages(IdentityId([1u8; 32]), DeviceId([1u8; 16]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Rejected(_)));

        // Connection stays usable
        assert!(client
            .get_messages(IdentityId([1u8; 32]), DeviceId([1u8; 16]))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_answer_the_next() {
        let url = serve(Arc::new(SlowPuts(MemoryRelay::new()))).await;
        let client = WebSocketRelay::connect(url).await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), client.put_message(put(b"late"))).await;
        assert!(abandoned.is_err());

        // The late Stored reply must not be read as this Get's answer
        client
            .get_messages(IdentityId([1u8; 32]), DeviceId([1u8; 16]))
            .await
            .unwrap();
        let id = client.put_message(put(b"next")).await.unwrap();
        assert!(!id.0.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_transient() {
        let client = WebSocketRelay::lazy("ws://127.0.0.1:1");
        let err = client
            .get_messages(IdentityId([1u8; 32]), DeviceId([1u8; 16]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
