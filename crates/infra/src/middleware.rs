//! Per-delivery decision logic wrapped around a business handler.
//!
//! One call to [`DispatchMiddleware::handle`] is one cycle: read the job,
//! decide whether the delivery may run, record acceptance, run the handler,
//! record the outcome (resolve and advance the chain, or fail and retry) and
//! commit. A concurrency conflict on commit aborts the cycle; the caller
//! re-runs it from a fresh read.

use std::sync::Arc;

use tracing::{debug, info, warn};

use jobwarden_bus::{Delivery, MessageBus, MessageId};
use jobwarden_core::{AggregateRoot, Clock, DomainError, JobId, StructMap, Timestamp};
use jobwarden_jobs::{
    FailInfo, HandlerError, HandlerResult, Job, SealReason, WorkerInfoResolver,
};

use crate::repository::{JobRepository, JobStoreError, JobTransaction};

/// How a delivery was settled when no error needs reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler succeeded. `next` is the chain successor dispatched, if any.
    Resolved { job_id: JobId, next: Option<JobId> },
    /// Redelivery of a dispatch whose attempt already has an outcome.
    Duplicate(JobId),
    /// Delivery of a dispatch superseded by a later one.
    Stale(JobId),
}

#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    #[error("message {message_id} carries no job id")]
    Unbound { message_id: MessageId },

    #[error("no job {job_id} found for message {message_id}")]
    Orphan { job_id: JobId, message_id: MessageId },

    #[error("job {0} has been revoked")]
    AlreadyRevoked(JobId),

    #[error("job {0} exceeded its timeout")]
    TimeoutExceeded(JobId),

    /// The handler failed. The failure is already recorded on the job.
    #[error("job {job_id} failed: {error}")]
    Handler {
        job_id: JobId,
        #[source]
        error: HandlerError,
        /// Message published for the next attempt, when budget remained.
        redispatched: Option<MessageId>,
        sealed: Option<SealReason>,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("publish failed: {0}")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl MiddlewareError {
    /// Inconsistencies that no amount of redelivery can fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unbound { .. } | Self::Orphan { .. } => true,
            Self::Domain(e) => e.is_sealed(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }

    /// Nothing was committed; the delivery should be processed again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Publish(_))
    }
}

/// Outcome of the handler, recorded but not yet committed.
enum Settled {
    Resolved { next: Option<JobId> },
    Failed { error: HandlerError, redispatched: Option<MessageId> },
}

pub struct DispatchMiddleware<R, B> {
    repository: R,
    bus: B,
    clock: Arc<dyn Clock>,
    worker_info: Arc<dyn WorkerInfoResolver>,
}

impl<R, B> DispatchMiddleware<R, B>
where
    R: JobRepository,
    B: MessageBus,
{
    pub fn new(
        repository: R,
        bus: B,
        clock: Arc<dyn Clock>,
        worker_info: Arc<dyn WorkerInfoResolver>,
    ) -> Self {
        Self {
            repository,
            bus,
            clock,
            worker_info,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Run one delivery through the job lifecycle, invoking `next` as the
    /// business handler when the delivery is allowed to run.
    pub fn handle<F>(&self, delivery: &Delivery, next: F) -> Result<DeliveryOutcome, MiddlewareError>
    where
        F: FnOnce(&Job) -> HandlerResult,
    {
        let message_id = &delivery.message_id;
        let job_id = delivery
            .command
            .job_id
            .ok_or_else(|| MiddlewareError::Unbound {
                message_id: message_id.clone(),
            })?;
        let mut job = self
            .repository
            .find_by_id(job_id)?
            .ok_or_else(|| MiddlewareError::Orphan {
                job_id,
                message_id: message_id.clone(),
            })?;

        if let Some(reason) = job.sealed_due() {
            return match reason {
                SealReason::RevokeConfirmed => Err(MiddlewareError::AlreadyRevoked(job_id)),
                _ if is_latest_dispatch(&job, message_id) => {
                    debug!(%job_id, %message_id, %reason, "redelivery of a sealed job's last dispatch");
                    Ok(DeliveryOutcome::Duplicate(job_id))
                }
                _ => {
                    debug!(%job_id, %message_id, %reason, "superseded delivery of a sealed job");
                    Ok(DeliveryOutcome::Stale(job_id))
                }
            };
        }

        let now = self.clock.now();

        if job.is_revoked() {
            job.revoke_confirmed(now)?;
            self.commit_job(&job)?;
            info!(%job_id, reason = job.revoked_for(), "revocation confirmed on delivery");
            return Err(MiddlewareError::AlreadyRevoked(job_id));
        }

        if !is_latest_dispatch(&job, message_id) {
            debug!(%job_id, %message_id, "stale delivery skipped");
            return Ok(DeliveryOutcome::Stale(job_id));
        }
        if !job.awaiting_acceptance() && !job.has_open_attempt() {
            debug!(%job_id, %message_id, "attempt already settled");
            return Ok(DeliveryOutcome::Duplicate(job_id));
        }

        if job.timeout_exceeded(now) {
            job.sealed(now, SealReason::TimeoutExceeded)?;
            self.commit_job(&job)?;
            warn!(%job_id, deadline = ?job.deadline(), "job timed out before running");
            return Err(MiddlewareError::TimeoutExceeded(job_id));
        }

        if job.awaiting_acceptance() {
            job.accepted(now, self.worker_info.resolve()?)?;
        } else {
            debug!(%job_id, redelivery = delivery.is_redelivery(), "dispatch already accepted");
        }
        let attempt = job.attempts_count() + 1;
        debug!(%job_id, job_type = job.job_type(), attempt, "invoking handler");

        let outcome = next(&job).and_then(non_empty);
        let now = self.clock.now();

        let mut tx = self.repository.begin()?;
        let settled = match self.settle(&mut job, outcome, now, &mut tx) {
            Ok(settled) => settled,
            Err(e) => {
                self.repository.rollback(tx);
                return Err(e);
            }
        };
        tx.persist(&job);
        self.repository.commit(tx)?;

        match settled {
            Settled::Resolved { next } => {
                info!(%job_id, attempt, next = ?next, "job resolved");
                Ok(DeliveryOutcome::Resolved { job_id, next })
            }
            Settled::Failed {
                error,
                redispatched,
            } => {
                let sealed = job.sealed_due();
                warn!(
                    %job_id,
                    attempt,
                    kind = %error.kind(),
                    error = %error.message(),
                    sealed = ?sealed,
                    "job attempt failed"
                );
                Err(MiddlewareError::Handler {
                    job_id,
                    error,
                    redispatched,
                    sealed,
                })
            }
        }
    }

    /// Record the handler outcome on `job`, staging every touched job.
    fn settle(
        &self,
        job: &mut Job,
        outcome: HandlerResult,
        now: Timestamp,
        tx: &mut JobTransaction,
    ) -> Result<Settled, MiddlewareError> {
        match outcome {
            Ok(result) => {
                job.resolved(now, result)?;
                let next = self.advance_chain(job, now, tx)?;
                Ok(Settled::Resolved { next })
            }
            Err(error) => {
                let fail_info = FailInfo::from_handler_error(now, &error)?;
                match error.kind().seal_reason() {
                    Some(reason) => job.failed_with_seal(now, fail_info, reason)?,
                    None => job.failed(now, fail_info)?,
                }
                let redispatched = if job.is_sealed() {
                    None
                } else {
                    Some(self.dispatch(job, now)?)
                };
                Ok(Settled::Failed {
                    error,
                    redispatched,
                })
            }
        }
    }

    /// Dispatch the chain member following `job`, once.
    fn advance_chain(
        &self,
        job: &Job,
        now: Timestamp,
        tx: &mut JobTransaction,
    ) -> Result<Option<JobId>, MiddlewareError> {
        let (Some(chain_id), Some(position)) = (job.chain_id(), job.chain_position()) else {
            return Ok(None);
        };
        let Some(mut successor) = self.repository.find_next_in_chain(chain_id, position)? else {
            debug!(%chain_id, position, "chain complete");
            return Ok(None);
        };

        if successor.is_sealed() || !successor.dispatches().is_empty() {
            debug!(%chain_id, successor = %successor.id(), "successor already under way");
            return Ok(None);
        }
        if successor.is_revoked() {
            successor.revoke_confirmed(now)?;
            tx.persist(&successor);
            info!(%chain_id, successor = %successor.id(), "chain stopped at revoked member");
            return Ok(None);
        }

        self.dispatch(&mut successor, now)?;
        tx.persist(&successor);
        Ok(Some(*successor.id()))
    }

    fn dispatch(&self, job: &mut Job, now: Timestamp) -> Result<MessageId, MiddlewareError> {
        let message_id = self
            .bus
            .publish(&job.encoded_command())
            .map_err(|e| MiddlewareError::Publish(Box::new(e)))?;
        job.dispatched(now, Some(message_id.clone()))?;
        debug!(job_id = %job.id(), %message_id, "job dispatched");
        Ok(message_id)
    }

    fn commit_job(&self, job: &Job) -> Result<(), MiddlewareError> {
        let mut tx = self.repository.begin()?;
        tx.persist(job);
        self.repository.commit(tx)?;
        Ok(())
    }
}

/// A dispatch without a recorded message id matches any delivery.
fn is_latest_dispatch(job: &Job, message_id: &MessageId) -> bool {
    job.dispatches()
        .last()
        .is_some_and(|d| d.message_id().is_none_or(|id| id == message_id))
}

fn non_empty(result: StructMap) -> HandlerResult {
    if result.is_empty() {
        Err(HandlerError::business("handler returned an empty result"))
    } else {
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, geocode_command, result_map};
    use jobwarden_bus::EncodedCommand;
    use jobwarden_core::ChainId;
    use jobwarden_jobs::{HandlerErrorKind, JobConfiguration, JobStatus};

    fn enqueued(h: &Harness, max_retries: u32, timeout: Option<u64>) -> (Job, Delivery) {
        let manager = h
            .manager()
            .with_default_configuration(JobConfiguration::new(max_retries, timeout).unwrap());
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut job).unwrap();
        (job, last_delivery(h))
    }

    fn last_delivery(h: &Harness) -> Delivery {
        let message = h.bus.published().pop().unwrap();
        Delivery::first(message.message_id, message.command)
    }

    fn stored(h: &Harness, id: JobId) -> Job {
        h.repo.find_by_id(id).unwrap().unwrap()
    }

    fn succeed(_: &Job) -> HandlerResult {
        Ok(result_map("1 Main St"))
    }

    fn unreachable_handler(_: &Job) -> HandlerResult {
        panic!("handler must not run")
    }

    #[test]
    fn successful_delivery_accepts_and_resolves() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 1, None);
        h.advance(5);

        let outcome = h.middleware().handle(&delivery, succeed).unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Resolved {
                job_id: *job.id(),
                next: None
            }
        );

        let job = stored(&h, *job.id());
        assert_eq!(job.sealed_due(), Some(SealReason::Resolved));
        assert_eq!(job.attempts_count(), 1);
        assert_eq!(job.acceptances().len(), 1);
        assert_eq!(job.acceptances()[0].worker_info().name(), "test-worker");
        assert_eq!(job.resolved_at(), Some(h.now()));
        assert_eq!(job.result().unwrap()["address"], "1 Main St");
        assert_eq!(job.version(), 2);
    }

    #[test]
    fn handler_sees_the_accepted_job() {
        let h = Harness::new();
        let (_, delivery) = enqueued(&h, 1, None);

        h.middleware()
            .handle(&delivery, |job: &Job| {
                assert_eq!(job.status(), JobStatus::Running);
                assert_eq!(job.job_command()["address"], "1 Main St");
                Ok(result_map("ok"))
            })
            .unwrap();
    }

    #[test]
    fn unbound_and_orphaned_messages_are_fatal() {
        let h = Harness::new();
        let middleware = h.middleware();

        let unbound = Delivery::first(
            MessageId::new("m-1").unwrap(),
            EncodedCommand::new("geocode", None, result_map("x")),
        );
        let err = middleware.handle(&unbound, unreachable_handler).unwrap_err();
        assert!(matches!(err, MiddlewareError::Unbound { .. }));
        assert!(err.is_fatal());

        let missing = JobId::new();
        let orphan = Delivery::first(
            MessageId::new("m-2").unwrap(),
            EncodedCommand::new("geocode", Some(missing), result_map("x")),
        );
        let err = middleware.handle(&orphan, unreachable_handler).unwrap_err();
        assert!(matches!(err, MiddlewareError::Orphan { job_id, .. } if job_id == missing));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_failure_redispatches() {
        let h = Harness::new();
        let (job, first) = enqueued(&h, 2, None);
        let middleware = h.middleware();

        let err = middleware
            .handle(&first, |_: &Job| Err(HandlerError::retryable("geocoder unavailable")))
            .unwrap_err();
        let MiddlewareError::Handler {
            error,
            redispatched: Some(message_id),
            sealed: None,
            ..
        } = err
        else {
            panic!("expected a redispatched handler failure, got {err:?}");
        };
        assert_eq!(error.kind(), HandlerErrorKind::Retryable);

        let after = stored(&h, *job.id());
        assert_eq!(after.status(), JobStatus::Dispatched);
        assert_eq!(after.dispatches().len(), 2);
        assert_eq!(after.errors().len(), 1);
        assert_eq!(after.errors()[0].error_message(), "geocoder unavailable");
        assert_eq!(after.last_dispatched_message_id(), Some(&message_id));

        // The superseded message is skipped; the new one runs.
        assert_eq!(
            middleware.handle(&first, unreachable_handler).unwrap(),
            DeliveryOutcome::Stale(*job.id())
        );
        let retry = last_delivery(&h);
        assert_eq!(retry.message_id, message_id);
        middleware.handle(&retry, succeed).unwrap();

        let done = stored(&h, *job.id());
        assert_eq!(done.attempts_count(), 2);
        assert_eq!(done.acceptances().len(), 2);
        assert_eq!(done.sealed_due(), Some(SealReason::Resolved));
    }

    #[test]
    fn exhausted_budget_seals_without_redispatch() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 1, None);

        let err = h
            .middleware()
            .handle(&delivery, |_: &Job| Err(HandlerError::retryable("flaky")))
            .unwrap_err();
        assert!(matches!(
            err,
            MiddlewareError::Handler {
                redispatched: None,
                sealed: Some(SealReason::MaxRetriesReached),
                ..
            }
        ));
        assert_eq!(h.bus.publish_count(), 1);
        assert_eq!(
            stored(&h, *job.id()).sealed_due(),
            Some(SealReason::MaxRetriesReached)
        );
    }

    #[test]
    fn non_retryable_failure_seals_despite_budget() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 5, None);

        let err = h
            .middleware()
            .handle(&delivery, |_: &Job| Err(HandlerError::business("address unknown").with_code(404)))
            .unwrap_err();
        assert!(matches!(
            err,
            MiddlewareError::Handler {
                redispatched: None,
                sealed: Some(SealReason::NonRetryableError),
                ..
            }
        ));

        let job = stored(&h, *job.id());
        assert_eq!(job.attempts_count(), 1);
        assert_eq!(job.errors()[0].error_code(), 404);
        assert_eq!(h.bus.publish_count(), 1);
    }

    #[test]
    fn timeout_kind_seals_with_timeout_reason() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 3, None);

        h.middleware()
            .handle(&delivery, |_: &Job| Err(HandlerError::timeout("upstream deadline")))
            .unwrap_err();
        assert_eq!(
            stored(&h, *job.id()).sealed_due(),
            Some(SealReason::TimeoutExceeded)
        );
    }

    #[test]
    fn empty_result_is_a_non_retryable_failure() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 3, None);

        let err = h
            .middleware()
            .handle(&delivery, |_: &Job| Ok(StructMap::new()))
            .unwrap_err();
        let MiddlewareError::Handler { error, .. } = err else {
            panic!("expected handler failure, got {err:?}");
        };
        assert_eq!(error.kind(), HandlerErrorKind::BusinessLogic);

        let job = stored(&h, *job.id());
        assert!(job.result().is_none());
        assert_eq!(job.sealed_due(), Some(SealReason::NonRetryableError));
    }

    #[test]
    fn redelivery_of_a_settled_dispatch_is_a_duplicate() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 1, None);
        let middleware = h.middleware();
        middleware.handle(&delivery, succeed).unwrap();

        let again = h.bus.redeliver(&delivery.message_id).unwrap();
        assert!(again.is_redelivery());
        assert_eq!(
            middleware.handle(&again, unreachable_handler).unwrap(),
            DeliveryOutcome::Duplicate(*job.id())
        );
        assert_eq!(stored(&h, *job.id()).version(), 2);
    }

    #[test]
    fn superseded_message_of_a_sealed_job_is_stale() {
        let h = Harness::new();
        let (job, first) = enqueued(&h, 2, None);
        let middleware = h.middleware();
        middleware
            .handle(&first, |_: &Job| Err(HandlerError::retryable("flaky")))
            .unwrap_err();
        middleware.handle(&last_delivery(&h), succeed).unwrap();

        let resolved = stored(&h, *job.id());
        let again = h.bus.redeliver(&first.message_id).unwrap();
        assert_eq!(
            middleware.handle(&again, unreachable_handler).unwrap(),
            DeliveryOutcome::Stale(*job.id())
        );
        assert_eq!(stored(&h, *job.id()), resolved);
        assert_eq!(h.bus.publish_count(), 2);
    }

    #[test]
    fn sealed_interaction_is_fatal() {
        let err = MiddlewareError::from(DomainError::sealed("job is sealed"));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(!MiddlewareError::from(DomainError::validation("bad")).is_fatal());
    }

    #[test]
    fn revoked_job_is_confirmed_instead_of_run() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 1, None);
        h.manager().revoke_job(*job.id(), "customer cancelled").unwrap();
        let middleware = h.middleware();

        let err = middleware.handle(&delivery, unreachable_handler).unwrap_err();
        assert!(matches!(err, MiddlewareError::AlreadyRevoked(id) if id == *job.id()));
        let revoked = stored(&h, *job.id());
        assert_eq!(revoked.sealed_due(), Some(SealReason::RevokeConfirmed));
        assert!(revoked.acceptances().is_empty());

        let err = middleware.handle(&delivery, unreachable_handler).unwrap_err();
        assert!(matches!(err, MiddlewareError::AlreadyRevoked(_)));
    }

    #[test]
    fn expired_job_is_sealed_before_running() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 3, Some(60));
        h.advance(61);

        let err = h.middleware().handle(&delivery, unreachable_handler).unwrap_err();
        assert!(matches!(err, MiddlewareError::TimeoutExceeded(id) if id == *job.id()));
        assert!(!err.is_retryable());

        let job = stored(&h, *job.id());
        assert_eq!(job.sealed_due(), Some(SealReason::TimeoutExceeded));
        assert_eq!(job.attempts_count(), 0);
    }

    #[test]
    fn failed_redispatch_commits_nothing() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 3, None);
        h.bus.fail_next_publish("broker down");

        let err = h
            .middleware()
            .handle(&delivery, |_: &Job| Err(HandlerError::retryable("flaky")))
            .unwrap_err();
        assert!(matches!(err, MiddlewareError::Publish(_)));
        assert!(err.is_retryable());
        assert_eq!(stored(&h, *job.id()), job);
    }

    #[test]
    fn concurrent_write_aborts_the_cycle() {
        let h = Harness::new();
        let (job, delivery) = enqueued(&h, 1, None);
        let middleware = h.middleware();

        let err = middleware
            .handle(&delivery, |_: &Job| {
                // Another worker writes the job while this handler runs.
                let mut tx = h.repo.begin().unwrap();
                tx.persist(&stored(&h, *job.id()));
                h.repo.commit(tx).unwrap();
                Ok(result_map("ok"))
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());

        // A fresh cycle succeeds.
        middleware.handle(&delivery, succeed).unwrap();
        assert_eq!(stored(&h, *job.id()).version(), 3);
    }

    #[test]
    fn revoked_successor_stops_the_chain() {
        let h = Harness::new();
        let manager = h.manager();
        let mut jobs: Vec<Job> = (0..2)
            .map(|_| manager.create_job(&mut geocode_command()).unwrap())
            .collect();
        manager.enqueue_chain(ChainId::new(), &mut jobs).unwrap();

        // Revocation recorded but not yet confirmed.
        let mut tail = stored(&h, *jobs[1].id());
        tail.revoked(h.now(), "superseded").unwrap();
        let mut tx = h.repo.begin().unwrap();
        tx.persist(&tail);
        h.repo.commit(tx).unwrap();

        let outcome = h.middleware().handle(&last_delivery(&h), succeed).unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Resolved {
                job_id: *jobs[0].id(),
                next: None
            }
        );
        assert_eq!(h.bus.publish_count(), 1);
        assert_eq!(
            stored(&h, *jobs[1].id()).sealed_due(),
            Some(SealReason::RevokeConfirmed)
        );
    }
}
