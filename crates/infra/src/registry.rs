//! Business handler registration, keyed by job type.
//!
//! Handlers are registered against a concrete [`JobCommand`] type; the
//! registry erases that type so the dispatch layer can route a stored job to
//! its handler by `job_type` alone.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use jobwarden_jobs::{
    CommandFactory, CommandHandle, HandlerError, HandlerResult, Job, JobCommand,
    TypedCommandFactory,
};

/// Executes the business side of a job.
pub trait JobHandler<C: JobCommand>: Send + Sync {
    fn handle(&self, command: &CommandHandle<C>) -> HandlerResult;
}

impl<C, F> JobHandler<C> for F
where
    C: JobCommand,
    F: Fn(&CommandHandle<C>) -> HandlerResult + Send + Sync,
{
    fn handle(&self, command: &CommandHandle<C>) -> HandlerResult {
        self(command)
    }
}

/// Object-safe handler, working from the stored job.
pub trait DynJobHandler: Send + Sync {
    fn handle_job(&self, job: &Job) -> HandlerResult;

    fn job_type(&self) -> &'static str;
}

struct TypedJobHandler<C: JobCommand, H: JobHandler<C>> {
    handler: H,
    factory: TypedCommandFactory<C>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: JobCommand, H: JobHandler<C>> DynJobHandler for TypedJobHandler<C, H> {
    fn handle_job(&self, job: &Job) -> HandlerResult {
        // A payload that no longer decodes will not decode on retry either.
        let command = self.factory.create_from_job(job).map_err(|e| {
            HandlerError::business(format!("cannot rebuild {} command: {e}", C::JOB_TYPE))
        })?;
        self.handler.handle(&command)
    }

    fn job_type(&self) -> &'static str {
        C::JOB_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for job type '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Handlers by job type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn DynJobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        C: JobCommand,
        H: JobHandler<C> + 'static,
    {
        if self.handlers.contains_key(C::JOB_TYPE) {
            return Err(RegistryError::AlreadyRegistered(C::JOB_TYPE.to_string()));
        }
        let typed = TypedJobHandler {
            handler,
            factory: TypedCommandFactory::<C>::new(),
            _marker: PhantomData,
        };
        self.handlers.insert(C::JOB_TYPE, Arc::new(typed));
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn DynJobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Run the handler registered for `job`'s type.
    ///
    /// An unknown job type is reported as a non-retryable business error.
    pub fn dispatch(&self, job: &Job) -> HandlerResult {
        match self.handlers.get(job.job_type()) {
            Some(handler) => handler.handle_job(job),
            None => Err(HandlerError::business(format!(
                "unsupported job type '{}'",
                job.job_type()
            ))),
        }
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.registered_types())
            .finish()
    }
}
