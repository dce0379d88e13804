//! `jobwarden-bus` — message bus mechanics for job commands.
//!
//! The bus is an external collaborator: the job core only needs to publish an
//! encoded command (getting back a transport-assigned message id) and to be
//! told when a delivery is a redelivery.

pub mod bus;
pub mod in_memory;
pub mod message;

pub use bus::{MessageBus, Subscription};
pub use in_memory::{InMemoryBusError, InMemoryMessageBus, PublishedMessage};
pub use message::{Delivery, EncodedCommand, MessageId};
