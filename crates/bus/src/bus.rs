//! Message publishing/subscription abstraction (mechanics only).
//!
//! Delivery is **at-least-once**: the same message may be handed to consumers
//! more than once, and consumers are expected to be idempotent. Redeliveries
//! are flagged on [`Delivery`](crate::Delivery) so that a consumer can tell a
//! retry of the same dispatch apart from a fresh one.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::message::{Delivery, EncodedCommand, MessageId};

/// A subscription to a message stream.
///
/// Designed for single-threaded consumption; each subscription should be
/// drained by one worker thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport for job commands.
///
/// `publish` returns the identifier the transport assigned to the message;
/// the job records it as part of its dispatch history.
pub trait MessageBus: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish(&self, command: &EncodedCommand) -> Result<MessageId, Self::Error>;

    fn subscribe(&self) -> Subscription<Delivery>;

    /// Mark a delivery as processed. Transports without acknowledgement
    /// semantics keep the default no-op.
    fn acknowledge(&self, _delivery: &Delivery) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, command: &EncodedCommand) -> Result<MessageId, Self::Error> {
        (**self).publish(command)
    }

    fn subscribe(&self) -> Subscription<Delivery> {
        (**self).subscribe()
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        (**self).acknowledge(delivery)
    }
}
