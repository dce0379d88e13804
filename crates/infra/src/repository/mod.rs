//! Job persistence: repository contract, unit of work and query criteria.
//!
//! Writes go through a [`JobTransaction`]: jobs are staged with
//! [`JobTransaction::persist`] and written all-or-nothing by
//! [`JobRepository::commit`], which enforces optimistic concurrency on each
//! job's `version`. A job whose stored version moved since it was loaded makes
//! the whole commit fail with [`JobStoreError::Concurrency`].

pub mod in_memory;
pub mod postgres;

use jobwarden_core::{AggregateRoot, ChainId, ExpectedVersion, JobId, Timestamp};
use jobwarden_jobs::{Job, JobStatus, SealReason};
use serde::{Deserialize, Serialize};

pub use in_memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The stored version differs from the one the job was loaded at.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Another job already occupies this position of the chain.
    #[error("chain {chain_id} already has a job at position {position}")]
    ChainSlotTaken { chain_id: ChainId, position: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Another writer got there first; re-reading and retrying may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobStoreError::Concurrency(_) | JobStoreError::AlreadyExists(_))
    }

    pub fn is_chain_slot_taken(&self) -> bool {
        matches!(self, JobStoreError::ChainSlotTaken { .. })
    }
}

/// Jobs staged for an all-or-nothing write.
#[derive(Debug, Default)]
pub struct JobTransaction {
    staged: Vec<Job>,
}

impl JobTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the current state of `job`. Staging the same job again replaces
    /// the earlier snapshot.
    pub fn persist(&mut self, job: &Job) {
        match self.staged.iter_mut().find(|staged| staged.id() == job.id()) {
            Some(staged) => *staged = job.clone(),
            None => self.staged.push(job.clone()),
        }
    }

    pub fn staged(&self) -> &[Job] {
        &self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub(crate) fn into_staged(self) -> Vec<Job> {
        self.staged
    }
}

/// Version check applied to a staged job at commit time.
pub(crate) fn expected_version(job: &Job) -> ExpectedVersion {
    ExpectedVersion::from_version(job.version())
}

/// Pagination parameters for job queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of jobs to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for job queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobCriteria {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub chain_id: Option<ChainId>,
    pub sealed_due: Option<SealReason>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<Timestamp>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<Timestamp>,
    pub pagination: Pagination,
}

impl JobCriteria {
    pub fn matches(&self, job: &Job) -> bool {
        self.job_type.as_deref().is_none_or(|t| job.job_type() == t)
            && self.status.is_none_or(|s| job.status() == s)
            && self.chain_id.is_none_or(|c| job.chain_id() == Some(c))
            && self.sealed_due.is_none_or(|r| job.sealed_due() == Some(r))
            && self.created_after.is_none_or(|at| job.created_at() >= at)
            && self.created_before.is_none_or(|at| job.created_at() < at)
    }
}

/// Job repository abstraction.
///
/// Results of `find_by_criteria` are ordered by creation time, then id.
pub trait JobRepository: Send + Sync {
    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// The chain member following `position`, i.e. the one at `position + 1`.
    fn find_next_in_chain(
        &self,
        chain_id: ChainId,
        position: u32,
    ) -> Result<Option<Job>, JobStoreError>;

    fn find_by_criteria(&self, criteria: &JobCriteria) -> Result<Vec<Job>, JobStoreError>;

    /// Start a unit of work.
    fn begin(&self) -> Result<JobTransaction, JobStoreError> {
        Ok(JobTransaction::new())
    }

    /// Write every staged job, or none of them.
    ///
    /// Returns the written jobs carrying their new versions.
    fn commit(&self, tx: JobTransaction) -> Result<Vec<Job>, JobStoreError>;

    /// Discard a unit of work.
    fn rollback(&self, tx: JobTransaction) {
        tracing::debug!(staged = tx.len(), "job transaction rolled back");
    }
}

impl<R: JobRepository + ?Sized> JobRepository for std::sync::Arc<R> {
    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_id(job_id)
    }

    fn find_next_in_chain(
        &self,
        chain_id: ChainId,
        position: u32,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).find_next_in_chain(chain_id, position)
    }

    fn find_by_criteria(&self, criteria: &JobCriteria) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_criteria(criteria)
    }

    fn begin(&self) -> Result<JobTransaction, JobStoreError> {
        (**self).begin()
    }

    fn commit(&self, tx: JobTransaction) -> Result<Vec<Job>, JobStoreError> {
        (**self).commit(tx)
    }

    fn rollback(&self, tx: JobTransaction) {
        (**self).rollback(tx)
    }
}
