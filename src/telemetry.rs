//! Tracing setup for the gt CLI.
//!
//! Logs go to stderr so they never mix with command output that other
//! processes parse. Filter via GT_LOG (e.g. GT_LOG=gastown=debug).

use tracing_subscriber::EnvFilter;

/// Guard returned by [`init`]. Held for the life of the process.
pub struct TelemetryGuard;

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; later calls are no-ops (relevant under
/// `cargo test`, where several tests share a process).
pub fn init() -> TelemetryGuard {
    let filter = EnvFilter::try_from_env("GT_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    TelemetryGuard
}
