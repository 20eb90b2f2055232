//! Development-time tracing for debugging generation runs.
//!
//! Tracing is dev diagnostics only, via `RUST_LOG`, written to stderr. The
//! durable product output is the per-program artifact directory under the
//! storage root, which is written unconditionally.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=cadgen=debug cargo run -- generate --prompt "a 10mm cube"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
