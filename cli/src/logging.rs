//! Tracing / logging initialisation.

use factoryindex_core::config::LogConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise tracing from the `logging` section of the config.
///
/// `RUST_LOG`, when set, replaces the configured directives. `json_override`
/// forces JSON output regardless of the config.
pub fn init_tracing(config: &LogConfig, json_override: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json || json_override {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
