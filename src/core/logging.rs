//! Structured logging
//!
//! Sets up the global `tracing` subscriber: JSON or text output, an
//! `EnvFilter` that honours `RUST_LOG`, and either stdout or a size-rotated
//! log file behind a non-blocking writer. Plugin log calls arrive here tagged
//! with a `plugin` field.

use crate::core::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the non-blocking writer alive; drop it only at shutdown
pub struct Logger {
    _guard: WorkerGuard,
}

impl Logger {
    /// Initialize the logging system based on configuration
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let level = parse_log_level(&config.level)?;

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

        let (writer, guard) = match config.output.as_str() {
            "stdout" => tracing_appender::non_blocking(std::io::stdout()),
            "file" => {
                let log_file = config
                    .log_file
                    .as_ref()
                    .context("log_file must be specified when output is 'file'")?;

                if let Some(parent) = log_file.parent() {
                    std::fs::create_dir_all(parent).context("Failed to create log directory")?;
                }

                let appender =
                    RollingFileAppender::new(log_file, config.max_file_size, config.max_backups)?;
                tracing_appender::non_blocking(appender)
            }
            other => anyhow::bail!("Invalid output configuration: {}", other),
        };

        let fmt_layer = match config.format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_thread_names(true)
                .with_target(true)
                .boxed(),
            "text" => fmt::layer()
                .with_writer(writer)
                .with_thread_names(true)
                .with_target(true)
                .boxed(),
            other => anyhow::bail!("Invalid format configuration: {}", other),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;

        tracing::info!(
            level = %config.level,
            format = %config.format,
            output = %config.output,
            "Logging system initialized"
        );

        Ok(Logger { _guard: guard })
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {}", level),
    }
}

/// File writer that rotates `name`, `name.1`, ... `name.<max_backups>` once
/// the current file would exceed `max_file_size` bytes
pub struct RollingFileAppender {
    directory: PathBuf,
    filename: String,
    max_file_size: usize,
    max_backups: usize,
    current: Mutex<Option<(File, usize)>>,
}

impl RollingFileAppender {
    pub fn new(log_file: &Path, max_file_size: usize, max_backups: usize) -> Result<Self> {
        let directory = log_file
            .parent()
            .context("Log file must have a parent directory")?;
        let filename = log_file
            .file_name()
            .context("Log file must have a filename")?
            .to_str()
            .context("Log filename must be valid UTF-8")?;

        Ok(Self {
            directory: directory.to_path_buf(),
            filename: filename.to_string(),
            max_file_size,
            max_backups,
            current: Mutex::new(None),
        })
    }

    fn current_path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!("{}.{}", self.filename, index))
    }

    fn lock(&self) -> MutexGuard<'_, Option<(File, usize)>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn rotate(&self, current: &mut Option<(File, usize)>) -> std::io::Result<()> {
        *current = None;

        for i in (1..self.max_backups).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(i + 1))?;
            }
        }

        let path = self.current_path();
        if path.exists() {
            std::fs::rename(&path, self.backup_path(1))?;
        }
        Ok(())
    }

    fn open(&self, current: &mut Option<(File, usize)>) -> std::io::Result<()> {
        if current.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.current_path())?;
            let size = file.metadata()?.len() as usize;
            *current = Some((file, size));
        }
        Ok(())
    }
}

impl Write for RollingFileAppender {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut current = self.lock();
        self.open(&mut current)?;

        let size = current.as_ref().map_or(0, |(_, size)| *size);
        if size > 0 && size + buf.len() > self.max_file_size {
            self.rotate(&mut current)?;
            self.open(&mut current)?;
        }

        match current.as_mut() {
            Some((file, size)) => {
                let written = file.write(buf)?;
                *size += written;
                Ok(written)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "log file is not open",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.lock().as_mut() {
            Some((file, _)) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("debug"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("error"), Ok(Level::ERROR)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_rolling_appender_paths() {
        let appender = RollingFileAppender::new(Path::new("/tmp/logs/mango.log"), 1024, 5).unwrap();
        assert_eq!(appender.current_path(), PathBuf::from("/tmp/logs/mango.log"));
        assert_eq!(appender.backup_path(1), PathBuf::from("/tmp/logs/mango.log.1"));
        assert_eq!(appender.backup_path(2), PathBuf::from("/tmp/logs/mango.log.2"));
    }

    #[test]
    fn test_rolling_appender_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("mango.log");
        let mut appender = RollingFileAppender::new(&log_file, 16, 2).unwrap();

        appender.write_all(b"0123456789\n").unwrap();
        appender.write_all(b"abcdefghij\n").unwrap();
        appender.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&log_file).unwrap(), "abcdefghij\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("mango.log.1")).unwrap(),
            "0123456789\n"
        );
    }
}
