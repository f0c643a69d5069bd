//! Tracing initialization.

use tracing_subscriber::EnvFilter;

/// Default filter when `SKEIN_LOG` is unset.
const DEFAULT_FILTER: &str = "skein=info";

/// Initialize the global tracing subscriber from `SKEIN_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env("SKEIN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
