//! Development-time tracing for debugging runs.
//!
//! Tracing is diagnostics only: stderr, filtered by `RUST_LOG`. Run artifacts
//! (context snapshots, interaction logs, `final_result.json`) are always
//! written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=taskgraph=debug taskgraph run "Summarize sales.csv"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
