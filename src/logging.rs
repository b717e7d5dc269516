//! Structured logging setup: console plus an optional daily rolling file.
//!
//! `RUST_LOG` overrides the default filter.

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info,fiscal_link=debug";

#[derive(Error, Debug)]
pub enum LogInitError {
    #[error("Failed to create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create log file appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("Logging already initialised: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for rolling log files; `None` logs to the console only.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    /// Rotated files kept on disk.
    pub max_files: usize,
    pub default_filter: String,
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "fiscal-link".to_string(),
            max_files: 7,
            default_filter: DEFAULT_FILTER.to_string(),
            json: false,
        }
    }
}

impl LogOptions {
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file logging should be flushed; dropping it flushes pending lines.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>, LogInitError> {
    let (file_writer, guard) = match &options.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(&options.file_prefix)
                .filename_suffix("log")
                .max_log_files(options.max_files.max(1))
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
    });
    let (console_layer, json_layer) = if options.json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    tracing_subscriber::registry()
        .with(options.env_filter())
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = LogOptions::default();
        assert!(options.directory.is_none());
        assert_eq!(options.default_filter, "info,fiscal_link=debug");
        assert_eq!(options.file_prefix, "fiscal-link");
    }

    #[test]
    fn test_second_init_is_an_error() {
        let dir = std::env::temp_dir().join(format!("fiscal-link-logs-{}", uuid::Uuid::new_v4()));
        let options = LogOptions::default().with_directory(&dir);
        let first = init(&options);
        // another test binary thread may have installed a subscriber first
        if let Ok(guard) = first {
            assert!(guard.is_some());
            assert!(dir.is_dir());
        }
        assert!(matches!(init(&options), Err(LogInitError::Subscriber(_))));
        std::fs::remove_dir_all(&dir).ok();
    }
}
