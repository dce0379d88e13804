//! `jobwarden-infra` — orchestration and adapters around the job domain.
//!
//! - [`manager::JobManager`]: enqueue jobs and chains, revoke jobs
//! - [`middleware::DispatchMiddleware`]: per-delivery lifecycle decisions
//! - [`workers::DispatchWorker`]: background consumption with conflict retry
//! - [`repository`]: unit-of-work storage (in-memory and Postgres)
//! - [`bus`]: Redis Streams transport (feature `redis`)

pub mod bus;
pub mod config;
pub mod manager;
pub mod middleware;
pub mod registry;
pub mod repository;
pub mod workers;

mod integration_tests;
#[cfg(test)]
mod test_support;

pub use config::{ConfigError, JobQueueConfig};
pub use manager::{EnqueueError, JobManager};
pub use middleware::{DeliveryOutcome, DispatchMiddleware, MiddlewareError};
pub use registry::{DynJobHandler, HandlerRegistry, JobHandler, RegistryError};
pub use repository::{
    InMemoryJobRepository, JobCriteria, JobRepository, JobStoreError, JobTransaction, Pagination,
    PostgresJobRepository,
};
pub use workers::{DispatchWorker, WorkerHandle};
