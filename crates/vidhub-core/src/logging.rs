/*!
 * Logging functionality for vidhub.
 *
 * This module provides tracing setup and span helpers for consistent logging
 * across the vidhub crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence over `filter` when set.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "vidhub_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, true)
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.with_target)
}

fn install(filter: &str, with_target: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_fails() {
        // Only one global subscriber may be installed per process.
        let _ = init();
        assert!(init_with_filter("debug").is_err());
    }

    #[test]
    fn test_component_span() {
        let span = component_span("videohub", Some("10.0.0.5:9990"));
        let _guard = span.enter();
        let span = component_span("videohub", None);
        let _guard = span.enter();
    }
}
