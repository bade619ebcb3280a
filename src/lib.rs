//! Embed the PHP runtime in a Rust host process.
//!
//! This crate re-exports the workspace members:
//! - [`common`]: errors and configuration
//! - [`runtime`]: engine, execution contexts, value codec, receivers
//! - [`host`]: HTTP request/response bridging and log capture
//!
//! and provides the process-level helpers used by the `php-embed` binary.

pub use php_embed_common as common;
pub use php_embed_core as runtime;
pub use php_embed_host as host;

pub use php_embed_common::{ConfigFile, EngineError, LoggingConfig, RuntimeConfig};
pub use php_embed_core::{Engine, ExecutionContext, HostValue, MemoryRuntime};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Filter built from a configured directive.
pub fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::new(directive)
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| env_filter(&config.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .try_init()
}

/// Parse a `NAME=JSON` binding. A value that is not valid JSON is bound as a
/// plain string.
///
/// # Errors
///
/// Returns an error if there is no `=` or the name is empty.
pub fn parse_binding(binding: &str) -> Result<(String, HostValue), String> {
    let (name, value) = binding
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got '{binding}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{binding}'"));
    }

    let value = serde_json::from_str::<serde_json::Value>(value)
        .map_or_else(|_| HostValue::from(value), HostValue::from);
    Ok((name.to_string(), value))
}
