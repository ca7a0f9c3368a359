//! Logging setup
//!
//! Two `tracing-subscriber` fmt layers share one level: a console layer on
//! stderr and a plain-text layer appending to `<log_dir>/<YYYY-MM-DD>_messages.log`.
//! `RUST_LOG` overrides the level when set.

use chrono::NaiveDate;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to install log subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Effective level: `-v` flags win over the configured level
pub fn level_for(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_lowercase(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Log file for a given day
pub fn log_file_path(log_dir: &Path, date: NaiveDate) -> PathBuf {
    log_dir.join(format!("{}_messages.log", date.format("%Y-%m-%d")))
}

fn filter(level: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(level)?),
    }
}

/// Install the global subscriber. Returns the log file in use.
pub fn init(level: &str, log_dir: &Path) -> Result<PathBuf, LoggingError> {
    let path = log_file_path(log_dir, chrono::Local::now().date_naive());

    std::fs::create_dir_all(log_dir).map_err(|source| LoggingError::LogFile {
        path: path.clone(),
        source,
    })?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| LoggingError::LogFile {
            path: path.clone(),
            source,
        })?;

    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter(level)?);

    let logfile = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(file))
        .with_filter(filter(level)?);

    tracing_subscriber::registry()
        .with(console)
        .with(logfile)
        .try_init()?;

    Ok(path)
}
