//! The job entity: identity, configuration and append-only history.
//!
//! All mutation goes through the transition methods below. Each of them checks
//! the sealed marker first, then validates its preconditions, and only then
//! mutates, so a rejected transition leaves the job untouched.

use chrono::TimeDelta;
use jobwarden_bus::{EncodedCommand, MessageId};
use jobwarden_core::time::{self, Timestamp, format_timestamp, timestamp};
use jobwarden_core::{AggregateRoot, ChainId, DomainError, DomainResult, JobId, StructMap};
use serde::{Deserialize, Serialize};

use crate::command::{CommandHandle, JobCommand};
use crate::seal::{JobStatus, SealReason};
use crate::value_objects::{AcceptanceInfo, DispatchInfo, FailInfo, JobConfiguration, WorkerInfo};

/// Entity: Job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobRecord")]
pub struct Job {
    id: JobId,
    job_type: String,
    job_command: StructMap,
    #[serde(with = "timestamp")]
    created_at: Timestamp,
    dispatches: Vec<DispatchInfo>,
    acceptances: Vec<AcceptanceInfo>,
    #[serde(with = "timestamp::option")]
    revoked_at: Option<Timestamp>,
    revoked_for: Option<String>,
    #[serde(with = "timestamp::option")]
    revoke_confirmed_at: Option<Timestamp>,
    chain_id: Option<ChainId>,
    chain_position: Option<u32>,
    result: Option<StructMap>,
    #[serde(with = "timestamp::option")]
    resolved_at: Option<Timestamp>,
    attempts_count: u32,
    errors: Vec<FailInfo>,
    configuration: JobConfiguration,
    version: u64,
    #[serde(with = "timestamp::option")]
    sealed_at: Option<Timestamp>,
    sealed_due: Option<SealReason>,
}

fn ensure_not_before(
    at: Timestamp,
    reference: Timestamp,
    what: &str,
    reference_name: &str,
) -> DomainResult<()> {
    if at < reference {
        return Err(DomainError::validation(format!(
            "{what} ({}) precedes {reference_name} ({})",
            format_timestamp(&at),
            format_timestamp(&reference)
        )));
    }
    Ok(())
}

impl Job {
    /// Create a job for `command`, binding the command to it.
    ///
    /// The job starts with the standard configuration and no history.
    pub fn init_new<C: JobCommand>(
        id: JobId,
        command: &mut CommandHandle<C>,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        if id.is_nil() {
            return Err(DomainError::invalid_id("job id cannot be nil"));
        }
        let job_command = command.payload()?;
        command.bind(id)?;

        Ok(Self {
            id,
            job_type: C::JOB_TYPE.to_string(),
            job_command,
            created_at: time::normalize(created_at),
            dispatches: Vec::new(),
            acceptances: Vec::new(),
            revoked_at: None,
            revoked_for: None,
            revoke_confirmed_at: None,
            chain_id: None,
            chain_position: None,
            result: None,
            resolved_at: None,
            attempts_count: 0,
            errors: Vec::new(),
            configuration: JobConfiguration::standard(),
            version: 0,
            sealed_at: None,
            sealed_due: None,
        })
    }

    // -- transitions --------------------------------------------------------

    /// Record one publish of the command (first dispatch, retry or chain advance).
    pub fn dispatched(
        &mut self,
        dispatched_at: Timestamp,
        message_id: Option<MessageId>,
    ) -> DomainResult<()> {
        self.ensure_unsealed("dispatch")?;
        let dispatched_at = time::normalize(dispatched_at);
        ensure_not_before(dispatched_at, self.created_at, "dispatchedAt", "createdAt")?;

        self.dispatches.push(DispatchInfo::new(dispatched_at, message_id));
        Ok(())
    }

    /// Record that a worker accepted the latest dispatch.
    pub fn accepted(&mut self, accepted_at: Timestamp, worker_info: WorkerInfo) -> DomainResult<()> {
        self.ensure_unsealed("accept")?;
        let accepted_at = time::normalize(accepted_at);
        let last_dispatch = self
            .dispatches
            .last()
            .ok_or_else(|| DomainError::invariant("job was never dispatched"))?;
        if !self.awaiting_acceptance() {
            return Err(DomainError::invariant(
                "latest dispatch has already been accepted",
            ));
        }
        ensure_not_before(
            accepted_at,
            last_dispatch.dispatched_at(),
            "acceptedAt",
            "dispatchedAt",
        )?;

        self.acceptances.push(AcceptanceInfo::new(accepted_at, worker_info));
        Ok(())
    }

    /// Request cancellation. Does not seal; see [`Job::revoke_confirmed`].
    pub fn revoked(&mut self, revoked_at: Timestamp, reason: impl Into<String>) -> DomainResult<()> {
        self.ensure_unsealed("revoke")?;
        let revoked_at = time::normalize(revoked_at);
        let reason = reason.into();
        if self.revoked_at.is_some() {
            return Err(DomainError::invariant("job is already revoked"));
        }
        if reason.trim().is_empty() {
            return Err(DomainError::validation("revocation reason cannot be empty"));
        }
        ensure_not_before(revoked_at, self.created_at, "revokedAt", "createdAt")?;

        self.revoked_at = Some(revoked_at);
        self.revoked_for = Some(reason);
        Ok(())
    }

    /// Confirm a prior revocation; seals the job.
    pub fn revoke_confirmed(&mut self, confirmed_at: Timestamp) -> DomainResult<()> {
        self.ensure_unsealed("confirm revocation")?;
        let confirmed_at = time::normalize(confirmed_at);
        let revoked_at = self
            .revoked_at
            .ok_or_else(|| DomainError::invariant("job was never revoked"))?;
        ensure_not_before(confirmed_at, revoked_at, "revokeConfirmedAt", "revokedAt")?;

        self.revoke_confirmed_at = Some(confirmed_at);
        self.seal(confirmed_at, SealReason::RevokeConfirmed);
        Ok(())
    }

    /// Complete the current attempt successfully; seals the job.
    pub fn resolved(&mut self, resolved_at: Timestamp, result: StructMap) -> DomainResult<()> {
        self.ensure_unsealed("resolve")?;
        let resolved_at = time::normalize(resolved_at);
        let accepted_at = self.open_attempt_accepted_at()?;
        ensure_not_before(resolved_at, accepted_at, "resolvedAt", "acceptedAt")?;
        if result.is_empty() {
            return Err(DomainError::validation("result cannot be empty"));
        }

        self.attempts_count += 1;
        self.result = Some(result);
        self.resolved_at = Some(resolved_at);
        self.seal(resolved_at, SealReason::Resolved);
        Ok(())
    }

    /// Complete the current attempt with a failure.
    ///
    /// Seals with `max-retries-reached` once the attempt count reaches the
    /// configured budget; otherwise the job stays open for another dispatch.
    pub fn failed(&mut self, failed_at: Timestamp, fail_info: FailInfo) -> DomainResult<()> {
        let failed_at = self.record_failure(failed_at, fail_info)?;
        if self.attempts_count >= self.configuration.max_retries() {
            self.seal(failed_at, SealReason::MaxRetriesReached);
        }
        Ok(())
    }

    /// Complete the current attempt with a failure that must not be retried,
    /// sealing with `reason` whatever the remaining budget.
    pub fn failed_with_seal(
        &mut self,
        failed_at: Timestamp,
        fail_info: FailInfo,
        reason: SealReason,
    ) -> DomainResult<()> {
        self.ensure_unsealed("fail")?;
        if !reason.is_direct() {
            return Err(DomainError::validation(format!(
                "'{reason}' is not a failure seal reason"
            )));
        }
        let failed_at = self.record_failure(failed_at, fail_info)?;
        self.seal(failed_at, reason);
        Ok(())
    }

    /// Place the job at `position` in `chain_id`. Repeating the same binding is
    /// a no-op; moving to another chain or position is rejected.
    pub fn bind_to_chain(&mut self, chain_id: ChainId, position: u32) -> DomainResult<()> {
        self.ensure_unsealed("bind to a chain")?;
        if chain_id.is_nil() {
            return Err(DomainError::invalid_id("chain id cannot be nil"));
        }
        match (self.chain_id, self.chain_position) {
            (Some(current), Some(current_position))
                if current == chain_id && current_position == position =>
            {
                Ok(())
            }
            (Some(current), current_position) => Err(DomainError::invariant(format!(
                "job is already bound to chain {current} at position {current_position:?}"
            ))),
            _ => {
                self.chain_id = Some(chain_id);
                self.chain_position = Some(position);
                Ok(())
            }
        }
    }

    /// Replace the configuration wholesale.
    pub fn configure(&mut self, configuration: JobConfiguration) -> DomainResult<()> {
        self.ensure_unsealed("configure")?;
        self.configuration = configuration;
        Ok(())
    }

    /// Seal directly. Only failure reasons (`timeout-exceeded`,
    /// `non-retryable-error`, `max-retries-reached`) are accepted; the others
    /// are reached through their own transitions.
    pub fn sealed(&mut self, sealed_at: Timestamp, reason: SealReason) -> DomainResult<()> {
        self.ensure_unsealed("seal")?;
        let sealed_at = time::normalize(sealed_at);
        if !reason.is_direct() {
            return Err(DomainError::validation(format!(
                "'{reason}' cannot be applied as a direct seal"
            )));
        }
        ensure_not_before(sealed_at, self.created_at, "sealedAt", "createdAt")?;

        self.seal(sealed_at, reason);
        Ok(())
    }

    /// Record the version assigned by storage after a successful write.
    pub fn record_persisted(&mut self, version: u64) {
        self.version = version;
    }

    fn seal(&mut self, at: Timestamp, reason: SealReason) {
        self.sealed_at = Some(at);
        self.sealed_due = Some(reason);
    }

    fn record_failure(&mut self, failed_at: Timestamp, fail_info: FailInfo) -> DomainResult<Timestamp> {
        self.ensure_unsealed("fail")?;
        let failed_at = time::normalize(failed_at);
        let accepted_at = self.open_attempt_accepted_at()?;
        ensure_not_before(failed_at, accepted_at, "failedAt", "acceptedAt")?;

        self.attempts_count += 1;
        self.errors.push(fail_info);
        Ok(failed_at)
    }

    fn ensure_unsealed(&self, action: &str) -> DomainResult<()> {
        if self.sealed_at.is_some() {
            let reason = self.sealed_due.map(|r| r.as_str()).unwrap_or("unknown");
            return Err(DomainError::sealed(format!(
                "cannot {action} job {}: sealed due to {reason}",
                self.id
            )));
        }
        Ok(())
    }

    fn open_attempt_accepted_at(&self) -> DomainResult<Timestamp> {
        if !self.has_open_attempt() {
            return Err(DomainError::invariant(
                "job has no accepted attempt awaiting an outcome",
            ));
        }
        self.last_accepted_at()
            .ok_or_else(|| DomainError::invariant("job was never accepted"))
    }

    // -- queries -------------------------------------------------------------

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn job_command(&self) -> &StructMap {
        &self.job_command
    }

    /// The command as it goes on the bus.
    pub fn encoded_command(&self) -> EncodedCommand {
        EncodedCommand::new(self.job_type.clone(), Some(self.id), self.job_command.clone())
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn dispatches(&self) -> &[DispatchInfo] {
        &self.dispatches
    }

    pub fn last_dispatched_at(&self) -> Option<Timestamp> {
        self.dispatches.last().map(DispatchInfo::dispatched_at)
    }

    pub fn last_dispatched_message_id(&self) -> Option<&MessageId> {
        self.dispatches.last().and_then(DispatchInfo::message_id)
    }

    pub fn acceptances(&self) -> &[AcceptanceInfo] {
        &self.acceptances
    }

    pub fn last_accepted_at(&self) -> Option<Timestamp> {
        self.acceptances.last().map(AcceptanceInfo::accepted_at)
    }

    pub fn revoked_at(&self) -> Option<Timestamp> {
        self.revoked_at
    }

    pub fn revoked_for(&self) -> Option<&str> {
        self.revoked_for.as_deref()
    }

    pub fn revoke_confirmed_at(&self) -> Option<Timestamp> {
        self.revoke_confirmed_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.chain_id
    }

    pub fn chain_position(&self) -> Option<u32> {
        self.chain_position
    }

    pub fn result(&self) -> Option<&StructMap> {
        self.result.as_ref()
    }

    pub fn resolved_at(&self) -> Option<Timestamp> {
        self.resolved_at
    }

    pub fn attempts_count(&self) -> u32 {
        self.attempts_count
    }

    pub fn errors(&self) -> &[FailInfo] {
        &self.errors
    }

    pub fn configuration(&self) -> &JobConfiguration {
        &self.configuration
    }

    pub fn sealed_at(&self) -> Option<Timestamp> {
        self.sealed_at
    }

    pub fn sealed_due(&self) -> Option<SealReason> {
        self.sealed_due
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    /// The latest dispatch has not been accepted by any worker yet.
    pub fn awaiting_acceptance(&self) -> bool {
        self.acceptances.len() < self.dispatches.len()
    }

    /// An accepted attempt has no recorded outcome yet.
    pub fn has_open_attempt(&self) -> bool {
        (self.attempts_count as usize) < self.acceptances.len()
    }

    /// Creation time plus the configured timeout, if any.
    pub fn deadline(&self) -> Option<Timestamp> {
        let secs = i64::try_from(self.configuration.timeout()?).ok()?;
        self.created_at.checked_add_signed(TimeDelta::try_seconds(secs)?)
    }

    pub fn timeout_exceeded(&self, now: Timestamp) -> bool {
        self.deadline().is_some_and(|deadline| now > deadline)
    }

    pub fn status(&self) -> JobStatus {
        if let Some(reason) = self.sealed_due {
            JobStatus::Sealed(reason)
        } else if self.is_revoked() {
            JobStatus::Revoked
        } else if self.dispatches.is_empty() {
            JobStatus::Created
        } else if self.has_open_attempt() {
            JobStatus::Running
        } else if self.awaiting_acceptance() {
            JobStatus::Dispatched
        } else {
            JobStatus::AwaitingRetry
        }
    }

    // -- decoding ------------------------------------------------------------

    /// Structural invariants that must hold for any decoded job.
    fn validate(&self) -> DomainResult<()> {
        if self.id.is_nil() {
            return Err(DomainError::invalid_id("job id cannot be nil"));
        }
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job type cannot be empty"));
        }
        for dispatch in &self.dispatches {
            ensure_not_before(dispatch.dispatched_at(), self.created_at, "dispatchedAt", "createdAt")?;
        }
        if self.acceptances.len() > self.dispatches.len() {
            return Err(DomainError::invariant("more acceptances than dispatches"));
        }
        for (acceptance, dispatch) in self.acceptances.iter().zip(&self.dispatches) {
            ensure_not_before(
                acceptance.accepted_at(),
                dispatch.dispatched_at(),
                "acceptedAt",
                "dispatchedAt",
            )?;
        }

        let attempts = self.attempts_count as usize;
        if attempts > self.acceptances.len() {
            return Err(DomainError::invariant("more attempts than acceptances"));
        }
        let errors = self.errors.len();
        if errors > attempts || errors + 1 < attempts {
            return Err(DomainError::invariant(format!(
                "{errors} errors recorded for {attempts} attempts"
            )));
        }

        match (&self.result, self.resolved_at) {
            (Some(result), Some(resolved_at)) => {
                if result.is_empty() {
                    return Err(DomainError::validation("result cannot be empty"));
                }
                if let Some(accepted_at) = self.last_accepted_at() {
                    ensure_not_before(resolved_at, accepted_at, "resolvedAt", "acceptedAt")?;
                }
            }
            (None, None) => {}
            _ => return Err(DomainError::invariant("result and resolvedAt must be set together")),
        }

        match (self.revoked_at, &self.revoked_for, self.revoke_confirmed_at) {
            (None, None, None) => {}
            (Some(revoked_at), Some(_), confirmed) => {
                ensure_not_before(revoked_at, self.created_at, "revokedAt", "createdAt")?;
                if let Some(confirmed_at) = confirmed {
                    ensure_not_before(confirmed_at, revoked_at, "revokeConfirmedAt", "revokedAt")?;
                }
            }
            _ => return Err(DomainError::invariant("incomplete revocation record")),
        }

        if self.chain_id.is_some() != self.chain_position.is_some() {
            return Err(DomainError::invariant("chainId and chainPosition must be set together"));
        }

        match (self.sealed_at, self.sealed_due) {
            (None, None) => {
                if self.resolved_at.is_some() || self.revoke_confirmed_at.is_some() {
                    return Err(DomainError::invariant("terminal transition without seal"));
                }
            }
            (Some(_), Some(SealReason::Resolved)) if self.resolved_at.is_none() => {
                return Err(DomainError::invariant("sealed as resolved without a result"));
            }
            (Some(_), Some(SealReason::RevokeConfirmed)) if self.revoke_confirmed_at.is_none() => {
                return Err(DomainError::invariant("sealed as revoked without confirmation"));
            }
            (Some(_), Some(_)) => {}
            _ => return Err(DomainError::invariant("sealedAt and sealedDue must be set together")),
        }
        Ok(())
    }
}

impl AggregateRoot for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Undecoded form of [`Job`].
#[derive(Deserialize)]
struct JobRecord {
    id: JobId,
    job_type: String,
    job_command: StructMap,
    #[serde(with = "timestamp")]
    created_at: Timestamp,
    #[serde(default)]
    dispatches: Vec<DispatchInfo>,
    #[serde(default)]
    acceptances: Vec<AcceptanceInfo>,
    #[serde(default, with = "timestamp::option")]
    revoked_at: Option<Timestamp>,
    #[serde(default)]
    revoked_for: Option<String>,
    #[serde(default, with = "timestamp::option")]
    revoke_confirmed_at: Option<Timestamp>,
    #[serde(default)]
    chain_id: Option<ChainId>,
    #[serde(default)]
    chain_position: Option<u32>,
    #[serde(default)]
    result: Option<StructMap>,
    #[serde(default, with = "timestamp::option")]
    resolved_at: Option<Timestamp>,
    #[serde(default)]
    attempts_count: u32,
    #[serde(default)]
    errors: Vec<FailInfo>,
    configuration: JobConfiguration,
    #[serde(default)]
    version: u64,
    #[serde(default, with = "timestamp::option")]
    sealed_at: Option<Timestamp>,
    #[serde(default)]
    sealed_due: Option<SealReason>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DomainError;

    fn try_from(r: JobRecord) -> Result<Self, Self::Error> {
        let job = Job {
            id: r.id,
            job_type: r.job_type,
            job_command: r.job_command,
            created_at: r.created_at,
            dispatches: r.dispatches,
            acceptances: r.acceptances,
            revoked_at: r.revoked_at,
            revoked_for: r.revoked_for,
            revoke_confirmed_at: r.revoke_confirmed_at,
            chain_id: r.chain_id,
            chain_position: r.chain_position,
            result: r.result,
            resolved_at: r.resolved_at,
            attempts_count: r.attempts_count,
            errors: r.errors,
            configuration: r.configuration,
            version: r.version,
            sealed_at: r.sealed_at,
            sealed_due: r.sealed_due,
        };
        job.validate()?;
        Ok(job)
    }
}
