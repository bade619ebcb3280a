//! Configuration structures for php-embed.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Native engine settings (ini file, ini overrides)
//! - [`RequestConfig`]: Per-request defaults (document root)

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for php-embed.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Native engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-request defaults.
    #[serde(default)]
    pub request: RequestConfig,
}

/// Native engine configuration.
///
/// These settings are read once, when the engine is initialized.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Override path for the runtime's initialization (ini) file.
    ///
    /// When unset, the runtime's own lookup rules apply.
    #[serde(default)]
    pub ini_path: Option<PathBuf>,

    /// Ini entries layered over the built-in defaults.
    #[serde(default)]
    pub ini: BTreeMap<String, String>,
}

impl EngineConfig {
    /// All ini entries: the built-in defaults with the overrides applied.
    pub fn ini_entries(&self) -> BTreeMap<String, String> {
        let mut entries: BTreeMap<String, String> = defaults::INI
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();

        for (key, value) in &self.ini {
            entries.insert(key.clone(), value.clone());
        }

        entries
    }

    /// Render the ini entries as ini file text, one `key = value` per line.
    pub fn ini_text(&self) -> String {
        let mut text = String::new();
        for (key, value) in self.ini_entries() {
            let _ = writeln!(text, "{key} = {value}");
        }
        text
    }
}

/// Per-request defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequestConfig {
    /// Document root used when a context does not set its own.
    #[serde(default)]
    pub document_root: Option<String>,
}

/// Default value tables.
mod defaults {
    /// Built-in ini defaults for the embedded engine.
    pub const INI: &[(&str, &str)] = &[
        ("expose_php", "0"),
        ("default_mimetype", ""),
        ("html_errors", "0"),
        ("register_argc_argv", "1"),
        ("implicit_flush", "1"),
        ("output_buffering", "0"),
        ("max_execution_time", "0"),
        ("log_errors", "1"),
        ("error_log", "\"/tmp/php-error.log\""),
        ("max_input_time", "-1"),
    ];
}
