//! Job commands: the business payload carried on the bus.
//!
//! A command type declares its job type and is otherwise plain serde data.
//! Binding a command to a job happens at most once, through [`CommandHandle`];
//! on the consuming side the typed command is rebuilt from the stored job by a
//! [`CommandFactory`].

use std::marker::PhantomData;

use jobwarden_bus::EncodedCommand;
use jobwarden_core::{AggregateRoot, DomainError, DomainResult, JobId, StructMap, encoding};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::job::Job;

/// A typed job payload.
pub trait JobCommand: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier used to pick the command type back from a stored job.
    const JOB_TYPE: &'static str;
}

/// A command plus its one-time binding to a job.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandHandle<C> {
    command: C,
    job_id: Option<JobId>,
}

impl<C: JobCommand> CommandHandle<C> {
    pub fn new(command: C) -> Self {
        Self {
            command,
            job_id: None,
        }
    }

    /// Bind to `job_id`. Rebinding to the same job is a no-op; binding to a
    /// different job fails.
    pub fn bind(&mut self, job_id: JobId) -> DomainResult<()> {
        match self.job_id {
            Some(bound) if bound != job_id => Err(DomainError::invariant(format!(
                "{} command is already bound to job {bound}",
                C::JOB_TYPE
            ))),
            _ => {
                self.job_id = Some(job_id);
                Ok(())
            }
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn command(&self) -> &C {
        &self.command
    }

    pub fn into_command(self) -> C {
        self.command
    }

    pub fn payload(&self) -> DomainResult<StructMap> {
        encoding::encode(&self.command)
    }

    /// Wire form of this command, carrying the bound job id if any.
    pub fn encode(&self) -> DomainResult<EncodedCommand> {
        Ok(EncodedCommand::new(C::JOB_TYPE, self.job_id, self.payload()?))
    }
}

/// Rebuilds a typed command from a stored job.
pub trait CommandFactory: Send + Sync {
    type Command;

    fn supports(&self, job_type: &str) -> bool;

    /// Fails with a validation error for a job type this factory does not
    /// support or a payload that does not decode.
    fn create_from_job(&self, job: &Job) -> DomainResult<Self::Command>;
}

/// Factory for a single command type.
pub struct TypedCommandFactory<C> {
    _marker: PhantomData<fn() -> C>,
}

impl<C> TypedCommandFactory<C> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<C> Default for TypedCommandFactory<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: JobCommand> CommandFactory for TypedCommandFactory<C> {
    type Command = CommandHandle<C>;

    fn supports(&self, job_type: &str) -> bool {
        job_type == C::JOB_TYPE
    }

    fn create_from_job(&self, job: &Job) -> DomainResult<CommandHandle<C>> {
        if !self.supports(job.job_type()) {
            return Err(DomainError::validation(format!(
                "unsupported job type '{}' (expected '{}')",
                job.job_type(),
                C::JOB_TYPE
            )));
        }
        let command: C = encoding::decode(job.job_command())?;
        let mut handle = CommandHandle::new(command);
        handle.bind(*job.id())?;
        Ok(handle)
    }
}
