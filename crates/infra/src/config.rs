//! Configuration loading and representation.
//!
//! Everything is read from environment variables; every variable is optional.

use jobwarden_jobs::{JobConfiguration, ProcessWorkerInfoResolver};

const DEFAULT_CONFLICT_RETRIES: u32 = 3;
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_STREAM_KEY: &str = "jobwarden:jobs";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("invalid default job configuration: {0}")]
    InvalidJobConfiguration(String),
}

/// Settings shared by the job manager, the workers and the adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueConfig {
    /// Applied to every job created through the manager.
    pub default_job_configuration: JobConfiguration,
    /// How many times a worker re-runs a delivery after a concurrency conflict.
    pub conflict_retries: u32,
    /// Overrides the host name reported by workers.
    pub worker_name: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub stream_key: String,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            default_job_configuration: JobConfiguration::standard(),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            worker_name: None,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
        }
    }
}

impl JobQueueConfig {
    /// Read `JOBWARDEN_*`, `DATABASE_URL`, `REDIS_URL` and `REDIS_STREAM_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let number = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(name).filter(|v| !v.trim().is_empty()) {
                None => Ok(None),
                Some(value) => match value.trim().parse::<u64>() {
                    Ok(parsed) => Ok(Some(parsed)),
                    Err(_) => Err(ConfigError::InvalidNumber { name, value }),
                },
            }
        };
        let small = |name: &'static str| -> Result<Option<u32>, ConfigError> {
            number(name)?
                .map(|v| {
                    u32::try_from(v).map_err(|_| ConfigError::InvalidNumber {
                        name,
                        value: v.to_string(),
                    })
                })
                .transpose()
        };

        let max_retries = small("JOBWARDEN_DEFAULT_MAX_RETRIES")?
            .unwrap_or(defaults.default_job_configuration.max_retries());
        let timeout = match number("JOBWARDEN_DEFAULT_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(secs),
            None => defaults.default_job_configuration.timeout(),
        };
        let default_job_configuration = JobConfiguration::new(max_retries, timeout)
            .map_err(|e| ConfigError::InvalidJobConfiguration(e.to_string()))?;

        Ok(Self {
            default_job_configuration,
            conflict_retries: small("JOBWARDEN_CONFLICT_RETRIES")?
                .unwrap_or(defaults.conflict_retries),
            worker_name: lookup("JOBWARDEN_WORKER_NAME").filter(|v| !v.trim().is_empty()),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_key: lookup("REDIS_STREAM_KEY").unwrap_or(defaults.stream_key),
        })
    }

    /// Worker identity for this process, honouring `worker_name`.
    pub fn worker_info_resolver(&self) -> ProcessWorkerInfoResolver {
        match &self.worker_name {
            Some(name) => ProcessWorkerInfoResolver::with_name(name.clone()),
            None => ProcessWorkerInfoResolver::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use jobwarden_jobs::WorkerInfoResolver;

    fn load(vars: &[(&str, &str)]) -> Result<JobQueueConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        JobQueueConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(load(&[]).unwrap(), JobQueueConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("JOBWARDEN_DEFAULT_MAX_RETRIES", "5"),
            ("JOBWARDEN_DEFAULT_TIMEOUT_SECS", "0"),
            ("JOBWARDEN_CONFLICT_RETRIES", "7"),
            ("JOBWARDEN_WORKER_NAME", "worker-a"),
            ("DATABASE_URL", "postgres://localhost/jobs"),
        ])
        .unwrap();
        assert_eq!(config.default_job_configuration.max_retries(), 5);
        assert_eq!(config.default_job_configuration.timeout(), None);
        assert_eq!(config.conflict_retries, 7);
        assert_eq!(config.worker_name.as_deref(), Some("worker-a"));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));

        let info = config.worker_info_resolver().resolve().unwrap();
        assert_eq!(info.name(), "worker-a");
        assert_eq!(info.pid(), std::process::id());
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = load(&[("JOBWARDEN_CONFLICT_RETRIES", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                name: "JOBWARDEN_CONFLICT_RETRIES",
                value: "lots".into()
            }
        );
        assert!(matches!(
            load(&[("JOBWARDEN_DEFAULT_MAX_RETRIES", "0")]).unwrap_err(),
            ConfigError::InvalidJobConfiguration(_)
        ));
    }
}
