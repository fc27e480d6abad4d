//! Per-channel work queues
//!
//! Encrypt, decrypt and upload for one channel run one at a time behind an
//! async mutex; different channels never wait on each other. Callers that
//! need a channel which is still being established wait on a handshake
//! waiter instead of holding the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as QueueLock, OwnedMutexGuard};
use tracing::debug;

use crate::error::{EngineError, EngineResult, HandshakeFailure};
use crate::server::{CancelHandle, CancelToken};
use crate::session::ChannelKey;

/// Progress of a handshake as seen by waiters
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Still running
    Pending,
    /// Session installed
    Established,
    /// Gave up
    Failed(HandshakeFailure),
}

/// Waits for one handshake to finish
pub struct HandshakeWaiter {
    rx: watch::Receiver<HandshakeStatus>,
}

impl HandshakeWaiter {
    /// Wait until the handshake finishes, the timeout elapses or `cancel`
    /// fires
    pub async fn wait(mut self, timeout: Duration, cancel: &CancelToken) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match &*self.rx.borrow_and_update() {
                HandshakeStatus::Established => return Ok(()),
                HandshakeStatus::Failed(failure) => {
                    return Err(EngineError::HandshakeFailed(failure.clone()))
                }
                HandshakeStatus::Pending => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::HandshakeFailed(HandshakeFailure::Cancelled))
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(EngineError::HandshakeFailed(HandshakeFailure::Timeout))
                }
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::HandshakeFailed(HandshakeFailure::Other(
                            "handshake abandoned".into(),
                        )));
                    }
                }
            }
        }
    }
}

/// Serializes work per channel and tracks handshakes in flight
#[derive(Default)]
pub struct DispatchQueues {
    queues: Mutex<HashMap<ChannelKey, Arc<QueueLock<()>>>>,
    handshakes: Mutex<HashMap<ChannelKey, watch::Sender<HandshakeStatus>>>,
    revocations: Mutex<HashMap<ChannelKey, CancelHandle>>,
}

impl DispatchQueues {
    /// Empty queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the channel's turn; the queue is held until the guard drops
    pub async fn acquire(&self, key: &ChannelKey) -> OwnedMutexGuard<()> {
        let queue = self.queues.lock().entry(*key).or_default().clone();
        queue.lock_owned().await
    }

    /// Register interest in the channel's handshake.
    ///
    /// Returns `true` when no handshake was being tracked, meaning the
    /// caller is responsible for starting one.
    pub fn begin_handshake(&self, key: &ChannelKey) -> (bool, HandshakeWaiter) {
        let mut handshakes = self.handshakes.lock();
        if let Some(tx) = handshakes.get(key) {
            if *tx.borrow() == HandshakeStatus::Pending {
                return (false, HandshakeWaiter { rx: tx.subscribe() });
            }
        }
        let (tx, rx) = watch::channel(HandshakeStatus::Pending);
        handshakes.insert(*key, tx);
        debug!(channel = %key, "Tracking handshake");
        (true, HandshakeWaiter { rx })
    }

    /// Wake every waiter of the channel's handshake
    pub fn complete(&self, key: &ChannelKey, result: Result<(), HandshakeFailure>) {
        if let Some(tx) = self.handshakes.lock().remove(key) {
            let status = match result {
                Ok(()) => HandshakeStatus::Established,
                Err(failure) => HandshakeStatus::Failed(failure),
            };
            debug!(channel = %key, status = ?status, "Handshake finished");
            tx.send_replace(status);
        }
    }

    /// Token that fires when the channel's session is revoked
    pub fn revocation(&self, key: &ChannelKey) -> CancelToken {
        self.revocations
            .lock()
            .entry(*key)
            .or_insert_with(|| CancelToken::new().0)
            .token()
    }

    /// Stop in-flight work tied to the channel's current session
    pub fn revoke(&self, key: &ChannelKey) {
        if let Some(handle) = self.revocations.lock().remove(key) {
            handle.cancel();
        }
    }

    /// Drop all bookkeeping for channels matching `pred`
    pub fn forget(&self, pred: impl Fn(&ChannelKey) -> bool) {
        self.queues.lock().retain(|key, _| !pred(key));
        self.revocations.lock().retain(|key, handle| {
            if pred(key) {
                handle.cancel();
                return false;
            }
            true
        });
        let mut handshakes = self.handshakes.lock();
        let doomed: Vec<_> = handshakes.keys().filter(|k| pred(k)).copied().collect();
        for key in doomed {
            if let Some(tx) = handshakes.remove(&key) {
                tx.send_replace(HandshakeStatus::Failed(HandshakeFailure::Cancelled));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DeviceId, IdentityId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(n: u8) -> ChannelKey {
        ChannelKey::new(IdentityId([1u8; 32]), IdentityId([n; 32]), DeviceId([n; 16]))
    }

    #[tokio::test]
    async fn test_same_channel_runs_one_at_a_time() {
        let queues = Arc::new(DispatchQueues::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (queues, active, peak) = (queues.clone(), active.clone(), peak.clone());
            tasks.push(tokio::spawn(async move {
                let _turn = queues.acquire(&key(2)).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let queues = DispatchQueues::new();
        let _held = queues.acquire(&key(2)).await;
        let other = tokio::time::timeout(Duration::from_millis(100), queues.acquire(&key(3))).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_waiters_see_completion() {
        let queues = DispatchQueues::new();
        let (started, first) = queues.begin_handshake(&key(2));
        assert!(started);
        let (started, second) = queues.begin_handshake(&key(2));
        assert!(!started);

        queues.complete(&key(2), Ok(()));
        let cancel = CancelToken::never();
        first.wait(Duration::from_secs(1), &cancel).await.unwrap();
        second.wait(Duration::from_secs(1), &cancel).await.unwrap();

        // Finished handshakes are no longer tracked
        assert!(queues.begin_handshake(&key(2)).0);
    }

    #[tokio::test]
    async fn test_failure_reaches_waiter() {
        let queues = DispatchQueues::new();
        let (_, waiter) = queues.begin_handshake(&key(2));
        queues.complete(&key(2), Err(HandshakeFailure::Authentication));
        assert!(matches!(
            waiter.wait(Duration::from_secs(1), &CancelToken::never()).await,
            Err(EngineError::HandshakeFailed(HandshakeFailure::Authentication))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let queues = DispatchQueues::new();
        let (_, waiter) = queues.begin_handshake(&key(2));
        assert!(matches!(
            waiter.wait(Duration::from_secs(5), &CancelToken::never()).await,
            Err(EngineError::HandshakeFailed(HandshakeFailure::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let queues = DispatchQueues::new();
        let (_, waiter) = queues.begin_handshake(&key(2));
        let (handle, token) = CancelToken::new();
        handle.cancel();
        assert!(matches!(
            waiter.wait(Duration::from_secs(5), &token).await,
            Err(EngineError::HandshakeFailed(HandshakeFailure::Cancelled))
        ));
    }

    #[test]
    fn test_revocation_token_fires_once_per_session() {
        let queues = DispatchQueues::new();
        let first = queues.revocation(&key(2));
        queues.revoke(&key(2));
        assert!(first.is_cancelled());

        let second = queues.revocation(&key(2));
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_forget_cancels_tracking() {
        let queues = DispatchQueues::new();
        let token = queues.revocation(&key(2));
        queues.begin_handshake(&key(2));
        queues.begin_handshake(&key(3));

        queues.forget(|k| k.remote == IdentityId([2u8; 32]));
        assert!(token.is_cancelled());
        assert!(queues.begin_handshake(&key(2)).0);
        assert!(!queues.begin_handshake(&key(3)).0);
    }
}
