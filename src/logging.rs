//! Diagnostic tracing setup.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. The event log
//! under `state_dir/logs` is a product artifact written by the supervisor and
//! is unaffected by this filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_filter` (e.g. `"info"`).
/// Calling it twice is harmless, the second call is ignored.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
