//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Initialize JSON-formatted tracing with an env-filter derived from the
/// configured log level. `RUST_LOG` still wins when set.
pub fn init_tracing(config: &Config) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_new(&config.service.log_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    // Ignore the error when a subscriber is already installed (tests)
    let _ = tracing_subscriber::fmt().json().with_env_filter(filter).try_init();

    tracing::info!(service = %config.service.name, "Tracing initialized");
}

/// Header carrying W3C trace context
pub const TRACEPARENT: &str = "traceparent";
