//! Tracing initialization shared by the binaries.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `LOG_LEVEL` applied to
/// the given crate name, falling back to `default_filter`. Safe to call once
/// per process; later calls are ignored.
pub fn init_tracing(crate_name: &str, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = match std::env::var("LOG_LEVEL") {
            Ok(level) => format!("{}={}", crate_name, level),
            Err(_) => default_filter.to_string(),
        };
        EnvFilter::new(directive)
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
