//! In-process relay

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{MessageId, RelayApi, RelayEnvelope, RelayError, RelayPut, RelayResult};
use crate::crypto::{DeviceId, IdentityId};

type Mailbox = (IdentityId, DeviceId);

/// Mailboxes held in memory.
///
/// Serves tests directly and backs the `parley-relay` binary. Failures can
/// be queued with [`MemoryRelay::fail_next`]; each queued failure is
/// returned by one call instead of running it.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    mailboxes: Mutex<HashMap<Mailbox, Vec<RelayEnvelope>>>,
    faults: Mutex<VecDeque<RelayError>>,
    next_id: AtomicU64,
}

impl MemoryRelay {
    /// Empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `error`
    pub fn fail_next(&self, count: usize, error: RelayError) {
        let mut faults = self.faults.lock();
        faults.extend(std::iter::repeat(error).take(count));
    }

    /// Unacknowledged messages in a mailbox
    pub fn pending(&self, recipient: &IdentityId, device: &DeviceId) -> usize {
        self.mailboxes
            .lock()
            .get(&(*recipient, *device))
            .map_or(0, Vec::len)
    }

    fn injected_fault(&self) -> RelayResult<()> {
        match self.faults.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RelayApi for MemoryRelay {
    async fn put_message(&self, message: RelayPut) -> RelayResult<MessageId> {
        self.injected_fault()?;

        let message_id = MessageId(format!(
            "{:016x}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let envelope = RelayEnvelope {
            message_id: message_id.clone(),
            sender: message.sender,
            sender_device: message.sender_device,
            sequence_hint: message.sequence_hint,
            payload: message.payload,
        };
        self.mailboxes
            .lock()
            .entry((message.recipient, message.device))
            .or_default()
            .push(envelope);

        debug!(message = %message_id, recipient = %message.recipient.short(), "Stored message");
        Ok(message_id)
    }

    async fn get_messages(
        &self,
        recipient: IdentityId,
        device: DeviceId,
    ) -> RelayResult<Vec<RelayEnvelope>> {
        self.injected_fault()?;
        Ok(self
            .mailboxes
            .lock()
            .get(&(recipient, device))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_message(
        &self,
        recipient: IdentityId,
        device: DeviceId,
        message_id: MessageId,
    ) -> RelayResult<()> {
        self.injected_fault()?;
        let mut mailboxes = self.mailboxes.lock();
        if let Some(mailbox) = mailboxes.get_mut(&(recipient, device)) {
            mailbox.retain(|m| m.message_id != message_id);
            if mailbox.is_empty() {
                mailboxes.remove(&(recipient, device));
            }
        }
        Ok(())
    }
}
