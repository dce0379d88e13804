//! Terminal reasons and the derived status view of a job.

use serde::{Deserialize, Serialize};

/// Why a job reached its terminal (sealed) state.
///
/// Reasons are mutually exclusive: a job is sealed exactly once.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SealReason {
    /// Revocation was confirmed by a worker (or immediately, if never dispatched).
    #[serde(rename = "revoked")]
    RevokeConfirmed,
    Resolved,
    MaxRetriesReached,
    TimeoutExceeded,
    NonRetryableError,
}

impl SealReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealReason::RevokeConfirmed => "revoked",
            SealReason::Resolved => "resolved",
            SealReason::MaxRetriesReached => "max-retries-reached",
            SealReason::TimeoutExceeded => "timeout-exceeded",
            SealReason::NonRetryableError => "non-retryable-error",
        }
    }

    /// Reasons that may be applied through a direct seal rather than as a
    /// side effect of another transition.
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            SealReason::MaxRetriesReached
                | SealReason::TimeoutExceeded
                | SealReason::NonRetryableError
        )
    }
}

impl core::fmt::Display for SealReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SealReason {
    type Err = jobwarden_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "revoked" => Ok(SealReason::RevokeConfirmed),
            "resolved" => Ok(SealReason::Resolved),
            "max-retries-reached" => Ok(SealReason::MaxRetriesReached),
            "timeout-exceeded" => Ok(SealReason::TimeoutExceeded),
            "non-retryable-error" => Ok(SealReason::NonRetryableError),
            other => Err(jobwarden_core::DomainError::validation(format!(
                "unknown seal reason '{other}'"
            ))),
        }
    }
}

/// Lifecycle position of a job, derived from its history.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Created, never dispatched.
    Created,
    /// Latest dispatch not yet accepted by a worker.
    Dispatched,
    /// Accepted; the attempt has no outcome yet.
    Running,
    /// Latest attempt failed and the job has not been dispatched again.
    AwaitingRetry,
    /// Revocation requested, not confirmed yet.
    Revoked,
    Sealed(SealReason),
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Running => "running",
            JobStatus::AwaitingRetry => "awaiting-retry",
            JobStatus::Revoked => "revoked",
            JobStatus::Sealed(_) => "sealed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sealed(_))
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobStatus::Sealed(reason) => write!(f, "sealed ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}
