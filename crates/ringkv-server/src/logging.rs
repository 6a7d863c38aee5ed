//! Logging configuration for RingKV processes
//!
//! Servers and the coordinator log through the `tracing` framework. Output
//! goes to stdout, a daily-rolling file, or both.

use ringkv_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "ringkv.log";

/// Log output destination
#[derive(Debug, Clone)]
pub enum LogOutput {
    /// Output to stdout
    Stdout,
    /// Output to a file with daily rotation
    File(PathBuf),
    /// Output to both stdout and file
    Both(PathBuf),
}

/// Log format style
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// Human-readable multi-line format
    Pretty,
    /// Compact single-line format (default)
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level filter, `RUST_LOG` takes precedence
    pub level: String,
    /// Output destination
    pub output: LogOutput,
    /// Format style
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            format: LogFormat::Compact,
        }
    }
}

impl LogConfig {
    /// Create config with info level and stdout output
    pub fn info() -> Self {
        Self::default()
    }

    /// Create config with debug level
    pub fn debug() -> Self {
        Self::default().with_level("debug")
    }

    /// Set log output to file with rotation
    pub fn with_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.into());
        self
    }

    /// Set log output to both stdout and file
    pub fn with_both<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.into());
        self
    }

    /// Set log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set log level filter
    pub fn with_level<S: Into<String>>(mut self, level: S) -> Self {
        self.level = level.into();
        self
    }

    /// Install this configuration as the global subscriber.
    ///
    /// Returns a guard that must be kept alive while the process logs to a
    /// file. Dropping it flushes and stops the background writer.
    ///
    /// ```rust,no_run
    /// use ringkv::logging::LogConfig;
    ///
    /// let _guard = LogConfig::info().with_both("logs/server.log").init()?;
    /// # Ok::<(), ringkv::Error>(())
    /// ```
    pub fn init(self) -> Result<Option<WorkerGuard>> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| {
                Error::InvalidOperation(format!("Invalid log level '{}': {}", self.level, e))
            })?;
        let registry = tracing_subscriber::registry().with(env_filter);

        let (installed, guard) = match (self.output, self.format) {
            (LogOutput::Stdout, LogFormat::Pretty) => {
                (registry.with(fmt::layer().pretty()).try_init(), None)
            }
            (LogOutput::Stdout, LogFormat::Compact) => {
                (registry.with(fmt::layer().compact()).try_init(), None)
            }
            (LogOutput::File(path), LogFormat::Pretty) => {
                let (writer, guard) = file_writer(&path);
                let layer = fmt::layer().with_writer(writer).with_ansi(false).pretty();
                (registry.with(layer).try_init(), Some(guard))
            }
            (LogOutput::File(path), LogFormat::Compact) => {
                let (writer, guard) = file_writer(&path);
                let layer = fmt::layer().with_writer(writer).with_ansi(false).compact();
                (registry.with(layer).try_init(), Some(guard))
            }
            // Both outputs always use the compact layout.
            (LogOutput::Both(path), _) => {
                let (writer, guard) = file_writer(&path);
                let installed = registry
                    .with(fmt::layer().compact())
                    .with(fmt::layer().with_writer(writer).with_ansi(false).compact())
                    .try_init();
                (installed, Some(guard))
            }
        };

        installed.map_err(|e| {
            Error::InvalidOperation(format!("Logging already initialized: {}", e))
        })?;
        Ok(guard)
    }
}

fn file_writer(path: &Path) -> (NonBlocking, WorkerGuard) {
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, file_name))
}
