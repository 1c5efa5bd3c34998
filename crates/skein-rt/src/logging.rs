// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tracing bootstrap.
//!
//! The runtime only emits `tracing` events. Embedders that have no
//! subscriber of their own can install one here.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Filter directives are read from this variable.
pub const LOG_ENV: &str = "SKEIN_LOG";

static INIT_TEST_LOGGING: Once = Once::new();

/// Install a fmt subscriber filtered by `SKEIN_LOG` (default `warn`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

/// Trace-level output captured by the test harness. First call wins.
pub fn init_test_logging() {
    INIT_TEST_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_names(true)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}
