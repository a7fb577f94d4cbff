//! Tracing setup
//!
//! The engine only emits `tracing` events. Hosts that do not install their own
//! subscriber can call `init()`; filtering follows `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Subscriber that writes through the test harness capture
#[cfg(test)]
pub(crate) fn init_for_tests() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadence_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
