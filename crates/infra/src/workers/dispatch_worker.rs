use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use jobwarden_bus::{Delivery, MessageBus, Subscription};

use crate::middleware::{DeliveryOutcome, DispatchMiddleware, MiddlewareError};
use crate::registry::HandlerRegistry;
use crate::repository::JobRepository;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Worker loop consuming job commands.
///
/// - Subscribes to the middleware's bus
/// - Runs every delivery through the dispatch middleware and the registry
/// - Re-runs a cycle from a fresh read after a concurrency conflict
/// - Leaves deliveries unacknowledged when nothing could be committed
#[derive(Debug)]
pub struct DispatchWorker;

impl DispatchWorker {
    /// Spawn a worker thread processing deliveries until shut down or until
    /// the subscription closes.
    pub fn spawn<R, B>(
        name: impl Into<String>,
        middleware: DispatchMiddleware<R, B>,
        registry: HandlerRegistry,
        conflict_retries: u32,
    ) -> std::io::Result<WorkerHandle>
    where
        R: JobRepository + 'static,
        B: MessageBus + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = middleware.bus().subscribe();

        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            worker_loop(&name, sub, shutdown_rx, &middleware, &registry, conflict_retries)
        })?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// Process one delivery, retrying the whole cycle up to
    /// `conflict_retries` times when another worker wrote the job first.
    pub fn process<R, B>(
        middleware: &DispatchMiddleware<R, B>,
        registry: &HandlerRegistry,
        delivery: &Delivery,
        conflict_retries: u32,
    ) -> Result<DeliveryOutcome, MiddlewareError>
    where
        R: JobRepository,
        B: MessageBus,
    {
        let mut conflicts = 0;
        loop {
            match middleware.handle(delivery, |job| registry.dispatch(job)) {
                Err(e) if e.is_conflict() && conflicts < conflict_retries => {
                    conflicts += 1;
                    debug!(message_id = %delivery.message_id, conflicts, "conflict, re-running cycle");
                }
                other => return other,
            }
        }
    }
}

fn worker_loop<R, B>(
    name: &str,
    sub: Subscription<Delivery>,
    shutdown_rx: mpsc::Receiver<()>,
    middleware: &DispatchMiddleware<R, B>,
    registry: &HandlerRegistry,
    conflict_retries: u32,
) where
    R: JobRepository,
    B: MessageBus,
{
    let tick = Duration::from_millis(250);
    info!(worker = name, "dispatch worker started");

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let delivery = match sub.recv_timeout(tick) {
            Ok(delivery) => delivery,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let result = DispatchWorker::process(middleware, registry, &delivery, conflict_retries);
        let acknowledge = match &result {
            Ok(outcome) => {
                debug!(worker = name, outcome = ?outcome, "delivery settled");
                true
            }
            Err(e) if e.is_retryable() => {
                warn!(worker = name, message_id = %delivery.message_id, error = %e, "delivery left for redelivery");
                false
            }
            Err(e) if e.is_fatal() => {
                error!(worker = name, message_id = %delivery.message_id, error = %e, "undeliverable message");
                true
            }
            Err(e) => {
                info!(worker = name, message_id = %delivery.message_id, error = %e, "delivery settled with error");
                true
            }
        };

        if acknowledge {
            if let Err(e) = middleware.bus().acknowledge(&delivery) {
                warn!(worker = name, message_id = %delivery.message_id, error = %e, "acknowledge failed");
            }
        }
    }

    info!(worker = name, "dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use jobwarden_core::AggregateRoot;
    use jobwarden_jobs::{CommandHandle, HandlerResult, SealReason};

    use crate::test_support::{Geocode, Harness, geocode_command, result_map};

    fn geocode_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Geocode, _>(|cmd: &CommandHandle<Geocode>| -> HandlerResult {
                Ok(result_map(&cmd.command().address))
            })
            .unwrap();
        registry
    }

    #[test]
    fn worker_resolves_enqueued_jobs() {
        let h = Harness::new();
        let worker = DispatchWorker::spawn("test-dispatch", h.middleware(), geocode_registry(), 3)
            .unwrap();

        let manager = h.manager();
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut job).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let resolved = loop {
            let stored = h.repo.find_by_id(*job.id()).unwrap().unwrap();
            if stored.is_sealed() || Instant::now() > deadline {
                break stored;
            }
            thread::sleep(Duration::from_millis(10));
        };
        worker.shutdown();

        assert_eq!(resolved.sealed_due(), Some(SealReason::Resolved));
        assert_eq!(resolved.result().unwrap()["address"], "1 Main St");
        assert_eq!(h.bus.acknowledged(), vec![job.last_dispatched_message_id().unwrap().clone()]);
    }

    #[test]
    fn conflicts_are_retried_from_a_fresh_read() {
        let h = Harness::new();
        let manager = h.manager();
        let mut job = manager.create_job(&mut geocode_command()).unwrap();
        manager.enqueue_job(&mut job).unwrap();
        let message = h.bus.published().remove(0);
        let delivery = Delivery::first(message.message_id, message.command);

        let mut registry = HandlerRegistry::new();
        let repo = h.repo.clone();
        let job_id = *job.id();
        let writes = std::sync::atomic::AtomicU32::new(0);
        registry
            .register::<Geocode, _>(move |_: &CommandHandle<Geocode>| -> HandlerResult {
                // The first run loses the race against a concurrent write.
                if writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    let current = repo.find_by_id(job_id).unwrap().unwrap();
                    let mut tx = repo.begin().unwrap();
                    tx.persist(&current);
                    repo.commit(tx).unwrap();
                }
                Ok(result_map("ok"))
            })
            .unwrap();

        let outcome = DispatchWorker::process(&h.middleware(), &registry, &delivery, 1).unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Resolved { .. }));

        let exhausted = {
            let h = Harness::new();
            let manager = h.manager();
            let mut job = manager.create_job(&mut geocode_command()).unwrap();
            manager.enqueue_job(&mut job).unwrap();
            let message = h.bus.published().remove(0);
            let delivery = Delivery::first(message.message_id, message.command);
            let repo = h.repo.clone();
            let job_id = *job.id();
            let mut registry = HandlerRegistry::new();
            registry
                .register::<Geocode, _>(move |_: &CommandHandle<Geocode>| -> HandlerResult {
                    let current = repo.find_by_id(job_id).unwrap().unwrap();
                    let mut tx = repo.begin().unwrap();
                    tx.persist(&current);
                    repo.commit(tx).unwrap();
                    Ok(result_map("ok"))
                })
                .unwrap();
            DispatchWorker::process(&h.middleware(), &registry, &delivery, 2).unwrap_err()
        };
        assert!(exhausted.is_conflict());
    }
}
