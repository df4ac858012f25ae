//! Tracing setup for embedding processes
//!
//! Library code only emits `tracing` events; binaries (and tests) call
//! [`init`] once to install a console subscriber honoring `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Install a global console subscriber with env-filter support.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
