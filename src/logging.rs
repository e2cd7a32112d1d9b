//! Tracing subscriber setup
//!
//! The routing core only emits `tracing` events. Embedding binaries and tests
//! call [`init`] once to get formatted output; `RUST_LOG` takes precedence
//! over the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Build the filter used by [`init`]
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global fmt subscriber.
///
/// Returns false if a global subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
        .is_ok()
}
