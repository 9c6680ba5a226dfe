// src/settings.rs
//
// Persisted console settings (last port, baud, line ending, batch draft, history).
// Stored as pretty-printed JSON in the platform config directory.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::io::serial::{LineEnding, DEFAULT_BAUD_RATE};

/// Application identifier; also the name of the config directory
pub const APP_IDENTIFIER: &str = "com.simplecom.app";

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Maximum number of history entries kept (and persisted)
pub const MAX_HISTORY: usize = 100;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Last used device identifier ("" = none)
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default, deserialize_with = "lenient_line_ending")]
    pub line_ending: LineEnding,
    /// Multi-line script in the batch send box
    #[serde(default)]
    pub batch_content: String,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// Sent commands, oldest first
    #[serde(default)]
    pub history: Vec<String>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_batch_interval_ms() -> u64 {
    100
}

/// An unrecognised line ending falls back to the default instead of
/// discarding the rest of the file
fn lenient_line_ending<'de, D>(deserializer: D) -> Result<LineEnding, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match serde_json::from_value(value.clone()) {
        Ok(mode) => Ok(mode),
        Err(_) => {
            tlog!("[settings] Unknown line ending {}; using {}", value, LineEnding::default());
            Ok(LineEnding::default())
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            line_ending: LineEnding::default(),
            batch_content: String::new(),
            batch_interval_ms: default_batch_interval_ms(),
            history: Vec::new(),
        }
    }
}

/// Settings file location inside a config directory
pub fn settings_path_in(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

/// Settings file location used by the command-line tool.
/// Resolves to the same file as the desktop app's `app_config_dir`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| settings_path_in(&dir.join(APP_IDENTIFIER)))
}

/// Load settings from `path`. A missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<AppSettings, SettingsError> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut settings: AppSettings = serde_json::from_str(&content)?;
    if settings.history.len() > MAX_HISTORY {
        let excess = settings.history.len() - MAX_HISTORY;
        settings.history.drain(..excess);
    }
    Ok(settings)
}

/// Load settings, falling back to defaults when the file cannot be used
pub fn load_settings_or_default(path: &Path) -> AppSettings {
    match load_settings(path) {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[settings] {}; using defaults", e);
            AppSettings::default()
        }
    }
}

/// Write settings to `path`, creating the parent directory if needed
pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content).map_err(io_err)
}
