//! Enqueue orchestration: publish a job's command, then durably record the
//! dispatch, all-or-nothing.
//!
//! Publishing happens *before* the commit. A crash between the two leaves a
//! message whose job was never recorded as dispatched; the dispatch
//! middleware reports it as an orphan (or a stale delivery) instead of
//! running it. The opposite order would risk persisted jobs that are never
//! published.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use jobwarden_bus::MessageBus;
use jobwarden_core::{AggregateRoot, ChainId, Clock, DomainError, JobId};
use jobwarden_jobs::{CommandHandle, Job, JobCommand, JobConfiguration};

use crate::repository::{JobRepository, JobStoreError, JobTransaction};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("a chain needs at least one job")]
    EmptyChain,
    #[error("job {0} appears more than once in the chain")]
    DuplicateJob(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Members after the head are dispatched when their predecessor resolves.
    #[error("job {job_id} is at chain position {position} and cannot be enqueued directly")]
    ChainTail { job_id: JobId, position: u32 },
    #[error("publish failed: {0}")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl EnqueueError {
    /// The request itself is invalid; repeating it cannot succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::EmptyChain
            | Self::DuplicateJob(_)
            | Self::NotFound(_)
            | Self::ChainTail { .. }
            | Self::Domain(_) => true,
            Self::Store(e) => e.is_chain_slot_taken(),
            Self::Publish(_) => false,
        }
    }

    /// A collaborator failed; the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }
}

/// Creates, enqueues and revokes jobs.
pub struct JobManager<R, B> {
    repository: R,
    bus: B,
    clock: Arc<dyn Clock>,
    default_configuration: JobConfiguration,
}

impl<R, B> JobManager<R, B> {
    pub fn new(repository: R, bus: B, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            bus,
            clock,
            default_configuration: JobConfiguration::standard(),
        }
    }

    /// Configuration given to jobs created through [`JobManager::create_job`].
    pub fn with_default_configuration(mut self, configuration: JobConfiguration) -> Self {
        self.default_configuration = configuration;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (R, B) {
        (self.repository, self.bus)
    }
}

impl<R, B> JobManager<R, B>
where
    R: JobRepository,
    B: MessageBus,
{
    /// Bind `command` to a fresh job carrying the default configuration.
    /// Nothing is published or stored.
    pub fn create_job<C: JobCommand>(
        &self,
        command: &mut CommandHandle<C>,
    ) -> Result<Job, EnqueueError> {
        let mut job = Job::init_new(JobId::new(), command, self.clock.now())?;
        job.configure(self.default_configuration)?;
        Ok(job)
    }

    /// Publish `job` and record the dispatch in one unit of work.
    ///
    /// On success `job` is replaced by its stored state. On failure the
    /// transaction is rolled back, `job` is left untouched and the original
    /// error is returned.
    pub fn enqueue_job(&self, job: &mut Job) -> Result<(), EnqueueError> {
        let mut tx = self.repository.begin()?;
        let mut working = job.clone();

        if let Err(e) = self.dispatch_into(&mut working, &mut tx) {
            self.repository.rollback(tx);
            return Err(e);
        }

        let committed = self.commit(tx)?;
        take_committed(job, committed);
        info!(job_id = %job.id(), job_type = job.job_type(), "job enqueued");
        Ok(())
    }

    /// Enqueue `jobs` as one chain, executed in list order.
    ///
    /// Positions are assigned from 0. Only the head is published now; the
    /// dispatch middleware publishes each following member once its
    /// predecessor resolves. All members are stored in one unit of work.
    pub fn enqueue_chain(&self, chain_id: ChainId, jobs: &mut [Job]) -> Result<(), EnqueueError> {
        if jobs.is_empty() {
            return Err(EnqueueError::EmptyChain);
        }
        let mut seen = HashSet::with_capacity(jobs.len());
        for job in jobs.iter() {
            if !seen.insert(*job.id()) {
                return Err(EnqueueError::DuplicateJob(*job.id()));
            }
        }

        let mut working = jobs.to_vec();
        for (position, job) in working.iter_mut().enumerate() {
            let position = u32::try_from(position)
                .map_err(|_| DomainError::validation("chain is too long"))?;
            job.bind_to_chain(chain_id, position)?;
        }

        let mut tx = self.repository.begin()?;
        let (head, tail) = working.split_at_mut(1);
        if let Err(e) = self.dispatch_into(&mut head[0], &mut tx) {
            self.repository.rollback(tx);
            return Err(e);
        }
        for job in tail.iter() {
            tx.persist(job);
        }

        let committed = self.commit(tx)?;
        for job in jobs.iter_mut() {
            take_committed(job, committed.clone());
        }
        info!(%chain_id, length = jobs.len(), "job chain enqueued");
        Ok(())
    }

    /// Request cancellation of a job.
    ///
    /// A job that was never dispatched is confirmed (and sealed) immediately;
    /// otherwise the next delivery of its command confirms the revocation
    /// instead of running it.
    pub fn revoke_job(&self, job_id: JobId, reason: &str) -> Result<Job, EnqueueError> {
        let mut job = self
            .repository
            .find_by_id(job_id)?
            .ok_or(EnqueueError::NotFound(job_id))?;

        let now = self.clock.now();
        job.revoked(now, reason)?;
        if job.dispatches().is_empty() {
            job.revoke_confirmed(now)?;
        }

        let mut tx = self.repository.begin()?;
        tx.persist(&job);
        let committed = self.commit(tx)?;
        take_committed(&mut job, committed);
        info!(%job_id, reason, confirmed = job.is_sealed(), "job revoked");
        Ok(job)
    }

    /// Publish `job`'s command, record the dispatch and stage the job.
    fn dispatch_into(&self, job: &mut Job, tx: &mut JobTransaction) -> Result<(), EnqueueError> {
        if job.is_sealed() {
            // Checked before publishing so no message goes out for it.
            return Err(DomainError::sealed(format!("job {} is sealed", job.id())).into());
        }
        if let Some(position) = job.chain_position().filter(|p| *p > 0) {
            return Err(EnqueueError::ChainTail {
                job_id: *job.id(),
                position,
            });
        }

        let message_id = self.bus.publish(&job.encoded_command()).map_err(|e| {
            warn!(job_id = %job.id(), error = %e, "publish failed");
            EnqueueError::Publish(Box::new(e))
        })?;
        debug!(job_id = %job.id(), %message_id, "job command published");

        job.dispatched(self.clock.now(), Some(message_id))?;
        tx.persist(job);
        Ok(())
    }

    fn commit(&self, tx: JobTransaction) -> Result<Vec<Job>, EnqueueError> {
        self.repository.commit(tx).map_err(|e| {
            warn!(error = %e, "job commit failed; published messages are orphaned");
            EnqueueError::Store(e)
        })
    }
}

fn take_committed(job: &mut Job, committed: Vec<Job>) {
    if let Some(stored) = committed.into_iter().find(|c| c.id() == job.id()) {
        *job = stored;
    }
}
