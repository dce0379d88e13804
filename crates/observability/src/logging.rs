//! Tracing/logging initialization.
//!
//! Job lifecycle events carry structured fields (`job_id`, `job_type`,
//! `message_id`, `attempt`), so logs are emitted as JSON lines.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// `RUST_LOG` if it parses, `default` otherwise.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the JSON subscriber. Returns `false` when a global subscriber was
/// already installed (by an earlier call or by the host application).
pub fn init(default: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        let _ = init("debug");
        assert!(!init("debug"));
        crate::init();
        tracing::info!(job_id = "test", "still logging");
    }
}
