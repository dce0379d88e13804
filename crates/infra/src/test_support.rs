//! Shared fixtures for the infra tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use jobwarden_bus::InMemoryMessageBus;
use jobwarden_core::time::parse_timestamp;
use jobwarden_core::{Clock, FixedClock, JobId, StructMap, Timestamp};
use jobwarden_jobs::{CommandHandle, Job, JobCommand, StaticWorkerInfoResolver, WorkerInfo};

use crate::manager::JobManager;
use crate::middleware::DispatchMiddleware;
use crate::repository::in_memory::InMemoryJobRepository;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Geocode {
    pub address: String,
}

impl JobCommand for Geocode {
    const JOB_TYPE: &'static str = "geocode";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Notify {
    pub recipient: String,
}

impl JobCommand for Notify {
    const JOB_TYPE: &'static str = "notify";
}

/// `secs` seconds after a fixed base instant.
pub(crate) fn t(secs: i64) -> Timestamp {
    let base = parse_timestamp("2024-03-01 09:00:00.000000+00:00").unwrap();
    base + chrono::Duration::seconds(secs)
}

pub(crate) fn geocode_command() -> CommandHandle<Geocode> {
    CommandHandle::new(Geocode {
        address: "1 Main St".into(),
    })
}

pub(crate) fn geocode_job(secs: i64) -> Job {
    Job::init_new(JobId::new(), &mut geocode_command(), t(secs)).unwrap()
}

pub(crate) fn result_map(address: &str) -> StructMap {
    let mut map = StructMap::new();
    map.insert("address".into(), address.into());
    map
}

pub(crate) fn worker_info() -> WorkerInfo {
    WorkerInfo::new(4242, "test-worker").unwrap()
}

pub(crate) type TestManager = JobManager<Arc<InMemoryJobRepository>, Arc<InMemoryMessageBus>>;
pub(crate) type TestMiddleware =
    DispatchMiddleware<Arc<InMemoryJobRepository>, Arc<InMemoryMessageBus>>;

/// In-memory repository, bus and a clock under the test's control.
pub(crate) struct Harness {
    pub repo: Arc<InMemoryJobRepository>,
    pub bus: Arc<InMemoryMessageBus>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            repo: InMemoryJobRepository::arc(),
            bus: Arc::new(InMemoryMessageBus::new()),
            clock: Arc::new(FixedClock::new(t(0))),
        }
    }

    pub fn manager(&self) -> TestManager {
        JobManager::new(self.repo.clone(), self.bus.clone(), self.clock.clone())
    }

    pub fn middleware(&self) -> TestMiddleware {
        DispatchMiddleware::new(
            self.repo.clone(),
            self.bus.clone(),
            self.clock.clone(),
            Arc::new(StaticWorkerInfoResolver::new(worker_info())),
        )
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}
