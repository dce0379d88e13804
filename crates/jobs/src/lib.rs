//! Job lifecycle domain module.
//!
//! This crate contains the job state machine and its value objects,
//! implemented purely as deterministic domain logic (no IO, no transport, no
//! storage). Every mutation of a [`Job`] goes through a validated transition.

pub mod command;
pub mod handler_error;
pub mod job;
pub mod seal;
pub mod value_objects;
pub mod worker;

pub use command::{CommandFactory, CommandHandle, JobCommand, TypedCommandFactory};
pub use handler_error::{HandlerError, HandlerErrorKind, HandlerResult};
pub use job::Job;
pub use seal::{JobStatus, SealReason};
pub use value_objects::{
    AcceptanceInfo, DispatchInfo, FailInfo, FailureDetails, JobConfiguration, WorkerInfo,
};
pub use worker::{ProcessWorkerInfoResolver, StaticWorkerInfoResolver, WorkerInfoResolver};
