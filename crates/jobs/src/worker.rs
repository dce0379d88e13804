//! Resolution of the accepting worker's identity.

use jobwarden_core::DomainResult;

use crate::value_objects::WorkerInfo;

/// Supplies the identity recorded when a worker accepts a delivery.
pub trait WorkerInfoResolver: Send + Sync {
    fn resolve(&self) -> DomainResult<WorkerInfo>;
}

impl<R: WorkerInfoResolver + ?Sized> WorkerInfoResolver for std::sync::Arc<R> {
    fn resolve(&self) -> DomainResult<WorkerInfo> {
        (**self).resolve()
    }
}

/// Current process id and host name (or an explicit name override).
#[derive(Debug, Clone, Default)]
pub struct ProcessWorkerInfoResolver {
    name: Option<String>,
}

impl ProcessWorkerInfoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl WorkerInfoResolver for ProcessWorkerInfoResolver {
    fn resolve(&self) -> DomainResult<WorkerInfo> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        };
        WorkerInfo::new(std::process::id(), name)
    }
}

/// Always reports the same identity.
#[derive(Debug, Clone)]
pub struct StaticWorkerInfoResolver(WorkerInfo);

impl StaticWorkerInfoResolver {
    pub fn new(info: WorkerInfo) -> Self {
        Self(info)
    }
}

impl WorkerInfoResolver for StaticWorkerInfoResolver {
    fn resolve(&self) -> DomainResult<WorkerInfo> {
        Ok(self.0.clone())
    }
}
