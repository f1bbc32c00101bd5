//! Configuration management

use clap::{Parser, Subcommand};
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid plugin configuration: {0}")]
    InvalidPlugin(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub plugins: PluginsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = with_defaults(ConfigBuilder::builder())?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Environment variables are prefixed with MANGO_ and use __ for nesting
        // Example: MANGO_PLUGINS__UNLOAD_TIMEOUT_SECS=600
        builder = builder.add_source(
            Environment::with_prefix("MANGO")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(plugin_dir) = &cli_args.plugin_dir {
            builder = builder.set_override("plugins.path", plugin_dir.display().to_string())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.plugins.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    Ok(builder
        .set_default("plugins.path", "./plugins")?
        .set_default("plugins.unload_timeout_secs", 1800)? // 30 minutes
        .set_default("plugins.call_timeout_secs", 30)?
        .set_default("plugins.promise_timeout_secs", 30)?
        .set_default("plugins.http_timeout_secs", 30)?
        .set_default("plugins.state_flush_interval_ms", 100)?
        .set_default("plugins.repositories", Vec::<String>::new())?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?
        .set_default("logging.max_file_size", 10485760)? // 10 MB
        .set_default("logging.max_backups", 5)?)
}

/// Command-line interface
#[derive(Debug, Parser)]
#[command(name = "mango-plugins")]
#[command(about = "Mango provider plugin host", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Plugin directory path
    #[arg(long, value_name = "DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List registered providers and discovered plugins
    List,
    /// Search a provider
    Search { provider: String, query: String },
    /// List the chapters of a series
    Chapters { provider: String, series: String },
    /// List the page URLs of a chapter
    Pages { provider: String, chapter: String },
    /// Reload one plugin, or all plugins when no id is given
    Reload { id: Option<String> },
    /// Show the compatible plugins offered by a repository
    RepoList { url: String },
    /// Install a plugin from a repository
    Install { url: String, plugin_id: String },
    /// Check configured repositories for plugin updates
    Updates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginsConfig {
    pub path: PathBuf,
    pub unload_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub promise_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub state_flush_interval_ms: u64,
    #[serde(default)]
    pub repositories: Vec<String>,
}

impl PluginsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidPlugin("path cannot be empty".to_string()));
        }

        for (name, value) in [
            ("unload_timeout_secs", self.unload_timeout_secs),
            ("call_timeout_secs", self.call_timeout_secs),
            ("promise_timeout_secs", self.promise_timeout_secs),
            ("http_timeout_secs", self.http_timeout_secs),
            ("state_flush_interval_ms", self.state_flush_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidPlugin(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn promise_timeout(&self) -> Duration {
        Duration::from_secs(self.promise_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn state_flush_interval(&self) -> Duration {
        Duration::from_millis(self.state_flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub max_file_size: usize, // bytes
    pub max_backups: usize,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        if self.max_file_size == 0 {
            return Err(ConfigError::InvalidLogging(
                "max_file_size must be greater than 0".to_string(),
            ));
        }

        if self.max_backups == 0 {
            return Err(ConfigError::InvalidLogging(
                "max_backups must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
