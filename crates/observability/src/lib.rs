//! Process-wide tracing setup shared by binaries embedding the job queue.

pub mod logging;

/// Initialize process-wide observability (JSON logs filtered by `RUST_LOG`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init(logging::DEFAULT_FILTER);
}
