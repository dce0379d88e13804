//! In-memory message bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, mpsc};

use thiserror::Error;

use crate::bus::{MessageBus, Subscription};
use crate::message::{Delivery, EncodedCommand, MessageId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,

    /// Publish was rejected (failure injected by a test).
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// Redelivery requested for a message that was never published.
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),
}

/// A message as recorded by the in-memory bus.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub message_id: MessageId,
    pub command: EncodedCommand,
}

#[derive(Debug, Default)]
struct State {
    subscribers: Vec<mpsc::Sender<Delivery>>,
    published: Vec<PublishedMessage>,
    delivery_counts: HashMap<MessageId, u32>,
    acknowledged: Vec<MessageId>,
    next_seq: u64,
    fail_next: Option<String>,
}

/// In-memory bus.
///
/// - No IO / no async
/// - Best-effort fan-out to every live subscription
/// - Keeps a log of everything published, for assertions
#[derive(Debug, Default)]
pub struct InMemoryMessageBus {
    state: Mutex<State>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `publish` call fail with `reason`.
    pub fn fail_next_publish(&self, reason: impl Into<String>) {
        if let Ok(mut state) = self.lock() {
            state.fail_next = Some(reason.into());
        }
    }

    /// Everything published so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().map(|s| s.published.clone()).unwrap_or_default()
    }

    /// Message ids acknowledged by consumers, in acknowledgement order.
    pub fn acknowledged(&self) -> Vec<MessageId> {
        self.lock().map(|s| s.acknowledged.clone()).unwrap_or_default()
    }

    pub fn publish_count(&self) -> usize {
        self.lock().map(|s| s.published.len()).unwrap_or_default()
    }

    /// Deliver an already published message again, as a transport would after
    /// a consumer crash or a missing acknowledgement.
    pub fn redeliver(&self, message_id: &MessageId) -> Result<Delivery, InMemoryBusError> {
        let mut state = self.lock()?;
        let command = state
            .published
            .iter()
            .find(|m| &m.message_id == message_id)
            .map(|m| m.command.clone())
            .ok_or_else(|| InMemoryBusError::UnknownMessage(message_id.clone()))?;

        let count = state.delivery_counts.entry(message_id.clone()).or_insert(1);
        *count += 1;
        let delivery = Delivery {
            message_id: message_id.clone(),
            command,
            delivery_count: *count,
        };

        state.subscribers.retain(|tx| tx.send(delivery.clone()).is_ok());
        Ok(delivery)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, InMemoryBusError> {
        self.state.lock().map_err(|_| InMemoryBusError::Poisoned)
    }
}

impl MessageBus for InMemoryMessageBus {
    type Error = InMemoryBusError;

    fn publish(&self, command: &EncodedCommand) -> Result<MessageId, Self::Error> {
        let mut state = self.lock()?;

        if let Some(reason) = state.fail_next.take() {
            tracing::debug!(job_type = %command.job_type, %reason, "injected publish failure");
            return Err(InMemoryBusError::Rejected(reason));
        }

        state.next_seq += 1;
        let message_id = MessageId(format!("mem-{}", state.next_seq));
        state.delivery_counts.insert(message_id.clone(), 1);
        state.published.push(PublishedMessage {
            message_id: message_id.clone(),
            command: command.clone(),
        });

        let delivery = Delivery::first(message_id.clone(), command.clone());

        // Drop any dead subscribers while publishing.
        state.subscribers.retain(|tx| tx.send(delivery.clone()).is_ok());

        Ok(message_id)
    }

    fn subscribe(&self) -> Subscription<Delivery> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.push(tx);
        }

        Subscription::new(rx)
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.lock()?.acknowledged.push(delivery.message_id.clone());
        Ok(())
    }
}
