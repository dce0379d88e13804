//! End-to-end job lifecycle scenarios.
//!
//! Manager → bus → dispatch middleware → handler registry → repository,
//! all in memory with a controlled clock.
//!
//! Verifies:
//! - Chains advance one member at a time
//! - Retry budgets and non-retryable failures seal at the right attempt
//! - Enqueue failures leave no persisted state behind

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use jobwarden_bus::{Delivery, MessageBus};
    use jobwarden_core::{AggregateRoot, ChainId, StructuralEncoding};
    use jobwarden_jobs::{
        CommandHandle, HandlerError, HandlerResult, Job, JobConfiguration, SealReason,
    };

    use crate::manager::EnqueueError;
    use crate::middleware::{DeliveryOutcome, MiddlewareError};
    use crate::registry::HandlerRegistry;
    use crate::repository::{JobCriteria, JobRepository, JobStoreError};
    use crate::test_support::{Geocode, Harness, geocode_command, result_map};
    use crate::workers::DispatchWorker;

    fn latest_delivery(h: &Harness) -> Delivery {
        let message = h.bus.published().pop().unwrap();
        Delivery::first(message.message_id, message.command)
    }

    fn stored(h: &Harness, job: &Job) -> Job {
        h.repo.find_by_id(*job.id()).unwrap().unwrap()
    }

    fn registry_with(
        handler: impl Fn(&CommandHandle<Geocode>) -> HandlerResult + Send + Sync + 'static,
    ) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register::<Geocode, _>(handler).unwrap();
        registry
    }

    fn run_latest(h: &Harness, registry: &HandlerRegistry) -> Result<DeliveryOutcome, MiddlewareError> {
        DispatchWorker::process(&h.middleware(), registry, &latest_delivery(h), 0)
    }

    #[test]
    fn chain_of_two_publishes_once_per_resolved_predecessor() {
        let h = Harness::new();
        let manager = h.manager();
        let mut jobs: Vec<Job> = (0..2)
            .map(|_| manager.create_job(&mut geocode_command()).unwrap())
            .collect();
        manager.enqueue_chain(ChainId::new(), &mut jobs).unwrap();
        assert_eq!(h.bus.publish_count(), 1);

        let registry = registry_with(|cmd| Ok(result_map(&cmd.command().address)));

        let first = run_latest(&h, &registry).unwrap();
        assert_eq!(
            first,
            DeliveryOutcome::Resolved {
                job_id: *jobs[0].id(),
                next: Some(*jobs[1].id())
            }
        );
        assert_eq!(h.bus.publish_count(), 2);
        assert_eq!(
            h.bus.published()[1].command.job_id,
            Some(*jobs[1].id())
        );

        let second = run_latest(&h, &registry).unwrap();
        assert_eq!(
            second,
            DeliveryOutcome::Resolved {
                job_id: *jobs[1].id(),
                next: None
            }
        );
        assert_eq!(h.bus.publish_count(), 2);

        for job in &jobs {
            assert_eq!(stored(&h, job).sealed_due(), Some(SealReason::Resolved));
        }
    }

    #[test]
    fn non_retryable_failure_with_single_retry() {
        let h = Harness::new();
        let manager = h
            .manager()
            .with_default_configuration(JobConfiguration::new(1, None).unwrap());
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut job).unwrap();

        let registry = registry_with(|_| Err(HandlerError::business("address rejected")));
        let err = run_latest(&h, &registry).unwrap_err();
        assert!(matches!(err, MiddlewareError::Handler { redispatched: None, .. }));

        let job = stored(&h, &job);
        assert_eq!(job.sealed_due(), Some(SealReason::NonRetryableError));
        assert_eq!(job.attempts_count(), 1);
        assert_eq!(job.errors().len(), 1);
        assert_eq!(job.dispatches().len(), 1);
        assert_eq!(h.bus.publish_count(), 1);
    }

    #[test]
    fn three_failures_then_success_within_budget() {
        let h = Harness::new();
        let manager = h
            .manager()
            .with_default_configuration(JobConfiguration::new(4, None).unwrap());
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut job).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = registry_with(move |cmd| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(anyhow::anyhow!("geocoder timed out").into())
            } else {
                Ok(result_map(&cmd.command().address))
            }
        });

        for _ in 0..3 {
            h.advance(1);
            let err = run_latest(&h, &registry).unwrap_err();
            assert!(matches!(
                err,
                MiddlewareError::Handler { redispatched: Some(_), sealed: None, .. }
            ));
        }
        h.advance(1);
        run_latest(&h, &registry).unwrap();

        let job = stored(&h, &job);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(job.dispatches().len(), 4);
        assert_eq!(job.attempts_count(), 4);
        assert_eq!(job.errors().len(), 3);
        assert_eq!(job.resolved_at(), Some(h.now()));
        assert_eq!(job.sealed_due(), Some(SealReason::Resolved));

        // The failure history survives a structural round trip.
        let decoded = Job::from_map(&job.to_map().unwrap()).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn publish_then_failed_persist_rolls_back() {
        let h = Harness::new();
        let manager = h.manager();
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        let before = job.clone();
        h.repo.fail_next_commit("connection reset");

        let err = manager.enqueue_job(&mut job).unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::Store(JobStoreError::Storage(ref reason)) if reason == "connection reset"
        ));
        assert_eq!(job, before);
        assert!(h.repo.find_by_id(*job.id()).unwrap().is_none());

        // The published message is an orphan for the consumer.
        let err = run_latest(&h, &registry_with(|_| Ok(result_map("x")))).unwrap_err();
        assert!(matches!(err, MiddlewareError::Orphan { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_job_types_seal_non_retryable() {
        let h = Harness::new();
        let manager = h
            .manager()
            .with_default_configuration(JobConfiguration::new(3, None).unwrap());
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut job).unwrap();

        let err = run_latest(&h, &HandlerRegistry::new()).unwrap_err();
        let MiddlewareError::Handler { error, .. } = err else {
            panic!("expected handler failure, got {err:?}");
        };
        assert!(error.message().contains("unsupported job type"));
        assert_eq!(
            stored(&h, &job).sealed_due(),
            Some(SealReason::NonRetryableError)
        );
    }

    #[test]
    fn redelivered_message_is_accepted_once() {
        let h = Harness::new();
        let manager = h.manager();
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut job).unwrap();
        let registry = registry_with(|_| Ok(result_map("ok")));

        let delivery = latest_delivery(&h);
        DispatchWorker::process(&h.middleware(), &registry, &delivery, 0).unwrap();
        let redelivered = h.bus.redeliver(&delivery.message_id).unwrap();
        let outcome = DispatchWorker::process(&h.middleware(), &registry, &redelivered, 0).unwrap();

        assert_eq!(outcome, DeliveryOutcome::Duplicate(*job.id()));
        assert_eq!(stored(&h, &job).acceptances().len(), 1);
        h.bus.acknowledge(&redelivered).unwrap();
        assert_eq!(h.bus.acknowledged(), vec![delivery.message_id]);
    }

    #[test]
    fn criteria_reflect_lifecycle() {
        let h = Harness::new();
        let manager = h.manager();
        let mut done = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut done).unwrap();
        run_latest(&h, &registry_with(|_| Ok(result_map("ok")))).unwrap();
        let mut waiting = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut waiting).unwrap();

        let resolved = h
            .repo
            .find_by_criteria(&JobCriteria {
                sealed_due: Some(SealReason::Resolved),
                ..JobCriteria::default()
            })
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id(), done.id());

        let geocodes = h
            .repo
            .find_by_criteria(&JobCriteria {
                job_type: Some("geocode".into()),
                ..JobCriteria::default()
            })
            .unwrap();
        assert_eq!(geocodes.len(), 2);
    }
}
