//! Wire-level message types.

use jobwarden_core::{DomainError, DomainResult, JobId, StructMap};
use serde::{Deserialize, Serialize};

/// Transport-assigned identifier of a published message.
///
/// Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(pub(crate) String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("message id must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job command as carried on the bus.
///
/// `job_id` is absent for commands that were never bound to a job; such a
/// message cannot be attributed to anything on the consuming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedCommand {
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub payload: StructMap,
}

impl EncodedCommand {
    pub fn new(job_type: impl Into<String>, job_id: Option<JobId>, payload: StructMap) -> Self {
        Self {
            job_type: job_type.into(),
            job_id,
            payload,
        }
    }
}

/// One delivery of a published message to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub command: EncodedCommand,
    /// 1 for the first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn first(message_id: MessageId, command: EncodedCommand) -> Self {
        Self {
            message_id,
            command,
            delivery_count: 1,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
