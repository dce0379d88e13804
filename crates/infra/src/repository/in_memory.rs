//! In-memory job repository for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use jobwarden_core::{AggregateRoot, ChainId, ExpectedVersion, JobId};
use jobwarden_jobs::Job;

use super::{JobCriteria, JobRepository, JobStoreError, JobTransaction, expected_version};

/// In-memory job repository.
///
/// Commits are atomic with respect to other commits (single write lock).
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    fail_next_commit: Mutex<Option<String>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `commit` fail with a storage error.
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.fail_next_commit.lock() {
            *slot = Some(reason.into());
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("in-memory repository lock poisoned".to_string())
    }
}

impl JobRepository for InMemoryJobRepository {
    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn find_next_in_chain(
        &self,
        chain_id: ChainId,
        position: u32,
    ) -> Result<Option<Job>, JobStoreError> {
        let Some(next) = position.checked_add(1) else {
            return Ok(None);
        };
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs
            .values()
            .find(|j| j.chain_id() == Some(chain_id) && j.chain_position() == Some(next))
            .cloned())
    }

    fn find_by_criteria(&self, criteria: &JobCriteria) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut matching: Vec<&Job> = jobs.values().filter(|j| criteria.matches(j)).collect();
        matching.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });

        Ok(matching
            .into_iter()
            .skip(criteria.pagination.offset as usize)
            .take(criteria.pagination.limit as usize)
            .cloned()
            .collect())
    }

    fn commit(&self, tx: JobTransaction) -> Result<Vec<Job>, JobStoreError> {
        if let Some(reason) = self
            .fail_next_commit
            .lock()
            .map_err(|_| Self::poisoned())?
            .take()
        {
            return Err(JobStoreError::Storage(reason));
        }

        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;

        // Check everything before writing anything.
        for job in tx.staged() {
            let stored = jobs.get(job.id()).map(AggregateRoot::version);
            let expected = expected_version(job);
            if !expected.matches(stored) {
                return Err(match (expected, stored) {
                    (ExpectedVersion::NoAggregate, Some(_)) => JobStoreError::AlreadyExists(*job.id()),
                    (_, None) => JobStoreError::NotFound(*job.id()),
                    (_, Some(actual)) => JobStoreError::Concurrency(format!(
                        "job {} is at version {actual}, expected {}",
                        job.id(),
                        job.version()
                    )),
                });
            }
        }

        check_chain_slots(&jobs, tx.staged())?;

        let mut committed = Vec::with_capacity(tx.len());
        for mut job in tx.into_staged() {
            job.record_persisted(job.version() + 1);
            jobs.insert(*job.id(), job.clone());
            committed.push(job);
        }
        Ok(committed)
    }
}

/// Each `(chain_id, position)` may be held by at most one job, counting the
/// staged snapshots in place of their stored versions.
fn check_chain_slots(stored: &HashMap<JobId, Job>, staged: &[Job]) -> Result<(), JobStoreError> {
    let staged_ids: HashSet<&JobId> = staged.iter().map(|j| j.id()).collect();
    let mut slots: HashMap<(ChainId, u32), JobId> = stored
        .values()
        .filter(|j| !staged_ids.contains(j.id()))
        .filter_map(|j| Some(((j.chain_id()?, j.chain_position()?), *j.id())))
        .collect();

    for job in staged {
        let (Some(chain_id), Some(position)) = (job.chain_id(), job.chain_position()) else {
            continue;
        };
        if slots.insert((chain_id, position), *job.id()).is_some() {
            return Err(JobStoreError::ChainSlotTaken { chain_id, position });
        }
    }
    Ok(())
}
