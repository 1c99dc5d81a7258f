//! Logging: `tracing-subscriber` initialization for production deployments.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize a human-readable subscriber honoring `RUST_LOG` (default `info`).
/// Intended for local development and tests.
pub fn init_default() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Initialize a structured JSON subscriber, for production deployments where
/// logs are shipped to an aggregator.
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().json().with_env_filter(filter).try_init();
}
