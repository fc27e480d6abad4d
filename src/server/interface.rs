//! Retrying relay client
//!
//! Transient relay errors are retried with exponential backoff and full
//! jitter; only exhaustion or a permanent rejection reaches the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use rand::Rng;
use tracing::{debug, warn};

use super::{CancelToken, MessageId, RelayApi, RelayEnvelope, RelayError, RelayPut, RelayResult};
use crate::config::{RelayConfig, RetryConfig};
use crate::crypto::{DeviceId, IdentityId};
use crate::error::{EngineError, EngineResult};
use crate::session::ChannelKey;

/// An encrypted payload waiting to be uploaded
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Channel the payload travels on
    pub key: ChannelKey,
    /// Device of the sending identity
    pub sender_device: DeviceId,
    /// Sequence number for data messages
    pub sequence: Option<u64>,
    /// Encoded envelope
    pub payload: Vec<u8>,
}

/// A payload fetched from the relay, not yet acknowledged
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Relay id, needed for acknowledgement
    pub message_id: MessageId,
    /// Claimed sender identity
    pub sender: IdentityId,
    /// Claimed sender device
    pub sender_device: DeviceId,
    /// Sequence hint supplied by the sender
    pub sequence_hint: Option<u64>,
    /// Encoded envelope
    pub payload: Vec<u8>,
}

impl From<RelayEnvelope> for InboundMessage {
    fn from(envelope: RelayEnvelope) -> Self {
        InboundMessage {
            message_id: envelope.message_id,
            sender: envelope.sender,
            sender_device: envelope.sender_device,
            sequence_hint: envelope.sequence_hint,
            payload: envelope.payload,
        }
    }
}

enum RetryFailure {
    Cancelled,
    Exhausted { attempts: u32, last: RelayError },
}

impl RetryFailure {
    fn into_engine_error(self) -> EngineError {
        match self {
            RetryFailure::Cancelled => EngineError::Cancelled,
            RetryFailure::Exhausted { last, .. } => last.into(),
        }
    }
}

enum PollState {
    Fetch,
    Drain(std::vec::IntoIter<RelayEnvelope>),
    Done,
}

/// Relay access with retry, polling and acknowledgement
pub struct ServerInterface {
    relay: Arc<dyn RelayApi>,
    retry: RetryConfig,
    config: RelayConfig,
}

impl ServerInterface {
    /// Wrap a relay
    pub fn new(relay: Arc<dyn RelayApi>, retry: RetryConfig, config: RelayConfig) -> Self {
        ServerInterface {
            relay,
            retry,
            config,
        }
    }

    /// Upload a payload; fails with `UploadFailed` once retries are exhausted
    /// or the relay rejects it
    pub async fn upload(
        &self,
        message: &OutboundMessage,
        cancel: &CancelToken,
    ) -> EngineResult<MessageId> {
        let put = RelayPut {
            sender: message.key.local,
            sender_device: message.sender_device,
            recipient: message.key.remote,
            device: message.key.device,
            sequence_hint: message.sequence,
            payload: message.payload.clone(),
        };

        match self
            .with_retry("upload", cancel, || self.relay.put_message(put.clone()))
            .await
        {
            Ok(id) => {
                debug!(channel = %message.key, message = %id, "Uploaded");
                Ok(id)
            }
            Err(RetryFailure::Cancelled) => Err(EngineError::Cancelled),
            Err(RetryFailure::Exhausted { attempts, last }) => {
                warn!(channel = %message.key, attempts, error = %last, "Upload failed");
                Err(EngineError::UploadFailed {
                    attempts,
                    reason: last.to_string(),
                })
            }
        }
    }

    /// Messages waiting for `(recipient, device)`.
    ///
    /// Nothing is fetched until the stream is first polled. Every message
    /// that is not acknowledged comes back on the next call.
    pub fn poll<'a>(
        &'a self,
        recipient: IdentityId,
        device: DeviceId,
        cancel: CancelToken,
    ) -> impl Stream<Item = EngineResult<InboundMessage>> + Send + 'a {
        stream::unfold(PollState::Fetch, move |state| {
            let cancel = cancel.clone();
            async move {
                match state {
                    PollState::Fetch => {
                        let fetched = self
                            .with_retry("poll", &cancel, || {
                                self.relay.get_messages(recipient, device)
                            })
                            .await;
                        match fetched {
                            Ok(envelopes) => {
                                debug!(
                                    recipient = %recipient.short(),
                                    count = envelopes.len(),
                                    "Fetched mailbox"
                                );
                                let mut pending = envelopes.into_iter();
                                pending
                                    .next()
                                    .map(|e| (Ok(InboundMessage::from(e)), PollState::Drain(pending)))
                            }
                            Err(failure) => Some((Err(failure.into_engine_error()), PollState::Done)),
                        }
                    }
                    PollState::Drain(mut pending) => {
                        if cancel.is_cancelled() {
                            return Some((Err(EngineError::Cancelled), PollState::Done));
                        }
                        pending
                            .next()
                            .map(|e| (Ok(InboundMessage::from(e)), PollState::Drain(pending)))
                    }
                    PollState::Done => None,
                }
            }
        })
    }

    /// Acknowledge a delivered message so the relay drops it
    pub async fn acknowledge(
        &self,
        recipient: IdentityId,
        device: DeviceId,
        message_id: &MessageId,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        self.with_retry("acknowledge", cancel, || {
            self.relay.delete_message(recipient, device, message_id.clone())
        })
        .await
        .map_err(RetryFailure::into_engine_error)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancelToken,
        mut attempt_once: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
                r = tokio::time::timeout(self.config.request_timeout(), attempt_once()) => {
                    r.unwrap_or(Err(RelayError::Timeout))
                }
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Relay request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Relay request failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(last) => {
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last,
                    })
                }
            }
        }
    }

    /// Full jitter: uniform in `[0, capped exponential delay]`
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.retry.delay_for_attempt(attempt);
        if !self.retry.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }
}
