//! udptunnel settings
//!
//! Relay configuration stored as a JSON file.
//!
//! ## Usage
//!
//! ```no_run
//! use udptunnel_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.profiling.enabled = true;
//! settings.validate()?;
//! settings.save()?;
//! # Ok::<(), udptunnel_settings::SettingsError>(())
//! ```

mod config;

pub use config::{
    DispatchSettings, IngressSettings, LoggingSettings, PolicySettings, ProfilingSettings,
    RouteSettings, Settings, SpoofRule, TlsSettings, TunnelSettings,
};

use std::path::PathBuf;

use thiserror::Error;
use udptunnel_keystore::default_config_dir;

/// Environment variable naming an explicit settings file
pub const CONFIG_FILE_ENV: &str = "UDPTUNNEL_CONFIG";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    match std::env::var_os(CONFIG_FILE_ENV) {
        Some(path) => PathBuf::from(path),
        None => default_config_dir().join("udptunnel.json"),
    }
}
