//! udptunnel logging
//!
//! `tracing` subscriber setup shared by the binaries. `RUST_LOG` always wins;
//! otherwise the verbosity level picks the filter.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Rotated log files kept when no retention is configured
pub const DEFAULT_MAX_LOG_FILES: usize = 7;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to open log file {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to set up log rotation for {path:?}: {reason}")]
    Rotation { path: PathBuf, reason: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Filter directives for a verbosity level: 0 = warn, 1 = info, 2+ = debug
pub fn level_directives(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn env_filter(level: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directives(level)))
}

/// Install the global subscriber, writing to `file` (no colours) or stderr
pub fn init_logging(level: u8, file: Option<&Path>) -> Result<(), LoggingError> {
    match file {
        Some(path) => init_file_logging(level, path, DEFAULT_MAX_LOG_FILES),
        None => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(env_filter(level))
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string())),
    }
}

/// Install the global subscriber writing to a daily rotated file
///
/// `udptunnel.log` becomes `udptunnel.<date>.log` in the same directory;
/// only the newest `max_files` are kept.
pub fn init_file_logging(level: u8, path: &Path, max_files: usize) -> Result<(), LoggingError> {
    let appender = rolling_appender(path, max_files)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(appender))
        .with(env_filter(level))
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

fn rolling_appender(path: &Path, max_files: usize) -> Result<RollingFileAppender, LoggingError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::OpenFile {
        path: path.to_path_buf(),
        source,
    })?;

    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("udptunnel");
    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(max_files.max(1));
    if let Some(suffix) = path.extension().and_then(|s| s.to_str()) {
        builder = builder.filename_suffix(suffix);
    }

    builder.build(dir).map_err(|e| LoggingError::Rotation {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
