//! Common types, errors, and configuration for php-embed.
//!
//! This crate provides shared functionality used across the php-embed workspace:
//! - Error types using `thiserror` for lifecycle, codec and callback failures
//! - Configuration structures for the engine and per-request defaults
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, RequestConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, LoggingConfig};
pub use error::{CallbackError, CodecError, EngineError};
