//! Tracing setup.
//!
//! Library code only emits `tracing` events; binaries and tests decide where
//! they go. [`init`] installs a `tracing-subscriber` registry with an
//! [`EnvFilter`] (`RUST_LOG` wins over the configured level) and one of three
//! output formats.
//!
//! # Example
//! ```no_run
//! use mixsig_daq::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json);
//! logging::init(config)?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Errors raised while setting up tracing.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Unknown level name
    #[error("Invalid log level '{0}'. Must be one of: trace, debug, info, warn, error")]
    InvalidLevel(String),
    /// Unknown output format
    #[error("Invalid log format '{0}'. Must be one of: pretty, compact, json")]
    InvalidFormat(String),
    /// The global subscriber was already set or could not be built
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Single-line format without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level emitted
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Configuration at `level` with the default format.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` configuration section.
    pub fn from_config(config: &LoggingConfig) -> Result<Self, LoggingError> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: config.format.parse()?,
            with_file_and_line: config.file_and_line,
            ..Default::default()
        })
    }

    /// Override the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already set this returns `Ok(())`,
/// which keeps it safe to call from tests.
pub fn init(config: TracingConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // another component got there first
            if e.to_string().contains("global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(LoggingError::Init(e.to_string()))
            }
        })
}

/// Initialize from the `[logging]` configuration section.
pub fn init_from_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    init(TracingConfig::from_config(config)?)
}

fn parse_log_level(level: &str) -> Result<Level, LoggingError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LoggingError::InvalidLevel(level.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_tracing_config_from_logging_section() {
        let section = LoggingConfig {
            level: "warn".to_string(),
            format: "json".to_string(),
            file_and_line: true,
        };
        let config = TracingConfig::from_config(&section).unwrap();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_file_and_line);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let section = LoggingConfig {
            format: "xml".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            TracingConfig::from_config(&section),
            Err(LoggingError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = TracingConfig::new(Level::ERROR).with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
