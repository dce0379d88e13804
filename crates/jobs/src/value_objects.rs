//! Immutable, validated records making up a job's history.
//!
//! Every value object is built through a validating constructor, and
//! deserialization routes through the same constructor (`try_from` a raw
//! record), so an invalid value is never observable.

use jobwarden_bus::MessageId;
use jobwarden_core::time::{self, Timestamp, timestamp};
use jobwarden_core::{DomainError, DomainResult, ValueObject};
use serde::{Deserialize, Serialize};

use crate::handler_error::HandlerError;

fn non_empty(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkerInfo

/// Identity of the worker process that accepted a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWorkerInfo")]
pub struct WorkerInfo {
    pid: u32,
    name: String,
}

#[derive(Deserialize)]
struct RawWorkerInfo {
    pid: u32,
    name: String,
}

impl WorkerInfo {
    pub fn new(pid: u32, name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if pid == 0 {
            return Err(DomainError::validation("pid must be positive"));
        }
        non_empty("worker name", &name)?;
        Ok(Self { pid, name })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TryFrom<RawWorkerInfo> for WorkerInfo {
    type Error = DomainError;

    fn try_from(raw: RawWorkerInfo) -> Result<Self, Self::Error> {
        Self::new(raw.pid, raw.name)
    }
}

impl ValueObject for WorkerInfo {}

// ---------------------------------------------------------------------------
// DispatchInfo

/// One publish of the job's command on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchInfo {
    #[serde(with = "timestamp")]
    dispatched_at: Timestamp,
    message_id: Option<MessageId>,
}

impl DispatchInfo {
    pub fn new(dispatched_at: Timestamp, message_id: Option<MessageId>) -> Self {
        Self {
            dispatched_at: time::normalize(dispatched_at),
            message_id,
        }
    }

    pub fn dispatched_at(&self) -> Timestamp {
        self.dispatched_at
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }
}

impl ValueObject for DispatchInfo {}

// ---------------------------------------------------------------------------
// AcceptanceInfo

/// One delivery accepted by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceInfo {
    #[serde(with = "timestamp")]
    accepted_at: Timestamp,
    worker_info: WorkerInfo,
}

impl AcceptanceInfo {
    pub fn new(accepted_at: Timestamp, worker_info: WorkerInfo) -> Self {
        Self {
            accepted_at: time::normalize(accepted_at),
            worker_info,
        }
    }

    pub fn accepted_at(&self) -> Timestamp {
        self.accepted_at
    }

    pub fn worker_info(&self) -> &WorkerInfo {
        &self.worker_info
    }
}

impl ValueObject for AcceptanceInfo {}

// ---------------------------------------------------------------------------
// FailInfo

/// Audit record of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFailInfo")]
pub struct FailInfo {
    #[serde(with = "timestamp")]
    failed_at: Timestamp,
    error_code: u32,
    error_message: String,
    error_line: u32,
    error_file: String,
    previous_error_code: Option<u32>,
    previous_error_message: Option<String>,
}

#[derive(Deserialize)]
struct RawFailInfo {
    #[serde(with = "timestamp")]
    failed_at: Timestamp,
    error_code: u32,
    error_message: String,
    error_line: u32,
    error_file: String,
    previous_error_code: Option<u32>,
    previous_error_message: Option<String>,
}

/// Location and cause of a failure, as captured where the error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    pub error_code: u32,
    pub error_message: String,
    pub error_line: u32,
    pub error_file: String,
    pub previous_error_code: Option<u32>,
    pub previous_error_message: Option<String>,
}

impl FailInfo {
    pub fn new(failed_at: Timestamp, details: FailureDetails) -> DomainResult<Self> {
        if details.error_line == 0 {
            return Err(DomainError::validation("error line must be positive"));
        }
        non_empty("error file", &details.error_file)?;
        if let Some(previous) = &details.previous_error_message {
            non_empty("previous error message", previous)?;
        }
        Ok(Self {
            failed_at: time::normalize(failed_at),
            error_code: details.error_code,
            error_message: details.error_message,
            error_line: details.error_line,
            error_file: details.error_file,
            previous_error_code: details.previous_error_code,
            previous_error_message: details.previous_error_message,
        })
    }

    /// Capture a handler error into an audit record.
    pub fn from_handler_error(failed_at: Timestamp, error: &HandlerError) -> DomainResult<Self> {
        Self::new(
            failed_at,
            FailureDetails {
                error_code: error.code(),
                error_message: error.message().to_string(),
                error_line: error.line(),
                error_file: error.file().to_string(),
                previous_error_code: error.previous_code(),
                previous_error_message: error.previous_message().map(str::to_string),
            },
        )
    }

    pub fn failed_at(&self) -> Timestamp {
        self.failed_at
    }

    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn error_line(&self) -> u32 {
        self.error_line
    }

    pub fn error_file(&self) -> &str {
        &self.error_file
    }

    pub fn previous_error_code(&self) -> Option<u32> {
        self.previous_error_code
    }

    pub fn previous_error_message(&self) -> Option<&str> {
        self.previous_error_message.as_deref()
    }
}

impl TryFrom<RawFailInfo> for FailInfo {
    type Error = DomainError;

    fn try_from(raw: RawFailInfo) -> Result<Self, Self::Error> {
        Self::new(
            raw.failed_at,
            FailureDetails {
                error_code: raw.error_code,
                error_message: raw.error_message,
                error_line: raw.error_line,
                error_file: raw.error_file,
                previous_error_code: raw.previous_error_code,
                previous_error_message: raw.previous_error_message,
            },
        )
    }
}

impl ValueObject for FailInfo {}

// ---------------------------------------------------------------------------
// JobConfiguration

/// Retry budget and timeout of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawJobConfiguration")]
pub struct JobConfiguration {
    max_retries: u32,
    /// Seconds, measured from the job's creation.
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct RawJobConfiguration {
    max_retries: u32,
    timeout: Option<u64>,
}

impl JobConfiguration {
    pub const DEFAULT_MAX_RETRIES: u32 = 1;
    pub const DEFAULT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

    pub fn new(max_retries: u32, timeout: Option<u64>) -> DomainResult<Self> {
        if max_retries == 0 {
            return Err(DomainError::validation("max retries must be at least 1"));
        }
        if timeout == Some(0) {
            return Err(DomainError::validation("timeout must be positive"));
        }
        Ok(Self {
            max_retries,
            timeout,
        })
    }

    /// One attempt, 24h timeout.
    pub fn standard() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            timeout: Some(Self::DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Option<u64> {
        self.timeout
    }
}

impl TryFrom<RawJobConfiguration> for JobConfiguration {
    type Error = DomainError;

    fn try_from(raw: RawJobConfiguration) -> Result<Self, Self::Error> {
        Self::new(raw.max_retries, raw.timeout)
    }
}

impl ValueObject for JobConfiguration {}
