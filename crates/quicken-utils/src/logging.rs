//! # Logging Utilities
//!
//! Logging infrastructure for Quicken using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Three output formats (pretty for development, compact for device logs, JSON for collection)
//! - Environment variable configuration
//! - Level filtering with `RUST_LOG`-style directives
//! - An optional daily-rolling file sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quicken_utils::init_logging;
//!
//! // Keep the guard alive for as long as file logging should flush.
//! let _guard = init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("table generation started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Directive filter (e.g., `RUST_LOG=quicken_core=debug`), takes precedence
//! - `QUICKEN_LOG_LEVEL`: Plain level used when `RUST_LOG` is unset (default: `info`)
//! - `QUICKEN_LOG_FORMAT`: `pretty`, `compact` or `json` (default: `pretty`)
//! - `QUICKEN_LOG_FILE`: Optional path to a log file, rolled daily

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    Pretty,
    /// Single-line format, suited to logcat-style sinks
    Compact,
    /// JSON format for log collection
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "compact" | "short" => Ok(LogFormat::Compact),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty', 'compact' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes and stops the background writer, so hold it for
/// the lifetime of the program. Console-only logging yields an empty guard.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment.
///
/// Reads `QUICKEN_LOG_FORMAT`, `QUICKEN_LOG_LEVEL`, `QUICKEN_LOG_FILE` and
/// `RUST_LOG` as described in the module docs.
///
/// ## Errors
///
/// Returns an error if:
/// - `QUICKEN_LOG_FORMAT` or `QUICKEN_LOG_LEVEL` holds an unknown value
/// - A global subscriber is already installed
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var("QUICKEN_LOG_FORMAT") {
        Ok(value) => LogFormat::from_str(&value).map_err(LoggingError::InvalidFormat)?,
        Err(_) => LogFormat::Pretty,
    };
    let level = match env::var("QUICKEN_LOG_LEVEL") {
        Ok(value) => LogLevel::from_str(&value).map_err(LoggingError::InvalidLevel)?,
        Err(_) => LogLevel::Info,
    };
    let log_file = env::var("QUICKEN_LOG_FILE").ok().map(PathBuf::from);

    init_logging_internal(format, level.into(), log_file.as_deref())
}

/// Initialize logging with an explicit level and format.
///
/// `RUST_LOG` still wins when set, so module-specific filters keep working.
/// `QUICKEN_LOG_FILE` is honoured.
///
/// ## Example
///
/// ```rust,no_run
/// use quicken_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Compact)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let log_file = env::var("QUICKEN_LOG_FILE").ok().map(PathBuf::from);
    init_logging_internal(format, level.into(), log_file.as_deref())
}

fn init_logging_internal(format: LogFormat, default_level: Level, log_file: Option<&Path>)
    -> Result<LoggingGuard, LoggingError>
{
    // RUST_LOG can override the default level with more specific filters
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let mut layers: Vec<BoxedLayer> = vec![console_layer(format, env_filter.clone())];
    let mut guard = LoggingGuard::default();

    if let Some(file_path) = log_file {
        let directory = file_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let file_name = file_path
            .file_name()
            .ok_or_else(|| LoggingError::InitializationFailed(format!("{} is not a file path", file_path.display())))?;
        let file_appender = tracing_appender::rolling::daily(directory, file_name);
        let (non_blocking, worker) = tracing_appender::non_blocking(file_appender);
        guard._file = Some(worker);
        layers.push(file_layer(format, non_blocking, env_filter));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;

    Ok(guard)
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);

    match format {
        LogFormat::Pretty => base
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, writer: tracing_appender::non_blocking::NonBlocking, filter: EnvFilter)
    -> BoxedLayer
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false); // No ANSI in files

    match format {
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty | LogFormat::Compact => base
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
