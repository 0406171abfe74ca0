//! Tracing setup helpers.
//!
//! The engine itself only emits `tracing` events; binaries and tests that
//! want console output call [`init`] once. The filter honors `RUST_LOG`
//! (e.g. `RUST_LOG=aurora_sls=debug`).

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Install a formatting subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("aurora_sls=info"));
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    });
}
