//! Tracing setup for the piece market tools.
//!
//! Console output follows the level chosen on the command line (or `RUST_LOG`);
//! a second layer writes everything down to TRACE into
//! `<logs_dir>/piece-market-last-run.log`, replaced on every run.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the full trace log.
pub const LOG_FILE_NAME: &str = "piece-market-last-run.log";

/// Errors that occur while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Failed to prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Global subscriber already installed: {reason}")]
    AlreadyInstalled { reason: String },
}

/// Installs console and file logging.
///
/// # Errors
///
/// - `TracingError::LogFile` - If `logs_dir` or the log file cannot be created
/// - `TracingError::AlreadyInstalled` - If a global subscriber is already set
pub fn init_tracing(console_level: Level, logs_dir: &Path) -> Result<PathBuf, TracingError> {
    let log_file_path = logs_dir.join(LOG_FILE_NAME);
    let log_file = create_dir_all(logs_dir)
        .and_then(|()| File::create(&log_file_path))
        .map_err(|source| TracingError::LogFile {
            path: log_file_path.clone(),
            source,
        })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TracingError::AlreadyInstalled {
            reason: e.to_string(),
        })?;

    tracing::debug!(
        console = %console_level,
        log_file = %log_file_path.display(),
        "Tracing initialized"
    );
    Ok(log_file_path)
}

/// Console verbosity selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Progress of imports, reads and expunges
    Info,
    /// Per-piece and per-block detail
    Debug,
    /// Everything
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        })
    }
}
