//! Configuration loading using Figment
//!
//! Configuration is merged from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables prefixed with `MIXSIG_`, using `__` between
//!    nested keys
//!
//! ```text
//! MIXSIG_LOGGING__LEVEL=debug
//! MIXSIG_ANALOG_IN__SAMPLE_RATE_HZ=2000000
//! MIXSIG_BUS__TIMEOUT_MS=50
//! ```
//!
//! Every key has a default, so an empty (or missing) file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use mixsig_daq::config::MixsigConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MixsigConfig::load_from("mixsig.toml")?;
//! config.validate()?;
//! println!("Log level: {}", config.logging.level);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::instrument::analog_in::AnalogIn;
use crate::instrument::{AcquisitionMode, ChannelSelector};

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "MIXSIG_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// figment could not read or merge a source
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value is out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// Writing the TOML template failed
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixsigConfig {
    /// Log output settings
    pub logging: LoggingConfig,
    /// Oscilloscope setup
    pub analog_in: AnalogInConfig,
    /// Record-mode polling
    pub record: RecordConfig,
    /// Protocol engine defaults
    pub bus: BusConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
    /// Include file and line numbers
    pub file_and_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            file_and_line: false,
        }
    }
}

/// One oscilloscope channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel index, 0-based
    pub index: usize,
    /// Whether the channel is acquired
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Full-scale peak-to-peak range in volts
    #[serde(default = "default_range")]
    pub range: f64,
    /// Offset in volts
    #[serde(default)]
    pub offset: f64,
    /// Attenuation factor applied to readings
    #[serde(default = "default_attenuation")]
    pub attenuation: f64,
}

/// Oscilloscope configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalogInConfig {
    /// Acquisition mode
    pub mode: AcquisitionMode,
    /// Sample rate in Hz
    pub sample_rate_hz: f64,
    /// Samples per channel; the device maximum when absent
    pub buffer_size: Option<usize>,
    /// Oversampling factor in Oversample mode
    pub oversample: u32,
    /// Record length in seconds, 0 for unbounded
    pub record_length_s: f64,
    /// Per-channel overrides; unlisted channels keep their defaults
    pub channels: Vec<ChannelConfig>,
}

impl Default for AnalogInConfig {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::Single,
            sample_rate_hz: 1_000_000.0,
            buffer_size: None,
            oversample: 1,
            record_length_s: 0.0,
            channels: Vec::new(),
        }
    }
}

/// Record-mode configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Interval between drains
    pub poll_interval_ms: u64,
    /// How long the CLI records for
    pub duration_ms: u64,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            duration_ms: 100,
        }
    }
}

/// Protocol engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Transfer timeout, 0 for none
    pub timeout_ms: u64,
    /// UART bit rate
    pub uart_rate_hz: f64,
    /// SPI clock
    pub spi_rate_hz: f64,
    /// I2C clock
    pub i2c_rate_hz: f64,
    /// CAN bit rate
    pub can_rate_hz: f64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            uart_rate_hz: 9_600.0,
            spi_rate_hz: 1_000_000.0,
            i2c_rate_hz: 100_000.0,
            can_rate_hz: 500_000.0,
        }
    }
}

// Default value functions
fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_range() -> f64 {
    5.0
}

fn default_attenuation() -> f64 {
    1.0
}

impl MixsigConfig {
    /// Load configuration from a TOML file and `MIXSIG_` environment variables
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    /// Load with a custom environment prefix.
    pub fn load_with_env_prefix<P: AsRef<Path>>(
        path: P,
        prefix: &str,
    ) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(prefix).split("__"))
            .extract()
            .map_err(Box::new)?;
        debug!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    /// Effective configuration as TOML, in the layout `load_from` reads.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::ValidationError(message));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return invalid(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        let analog = &self.analog_in;
        if !(analog.sample_rate_hz > 0.0) {
            return invalid(format!(
                "Invalid sample_rate_hz {}. Must be positive",
                analog.sample_rate_hz
            ));
        }
        if analog.oversample == 0 {
            return invalid("Invalid oversample 0. Must be at least 1".to_string());
        }
        if analog.record_length_s < 0.0 {
            return invalid(format!(
                "Invalid record_length_s {}. Must not be negative",
                analog.record_length_s
            ));
        }
        let mut indices = HashSet::new();
        for channel in &analog.channels {
            if !indices.insert(channel.index) {
                return invalid(format!("Duplicate channel index: {}", channel.index));
            }
            if channel.attenuation <= 0.0 {
                return invalid(format!(
                    "Invalid attenuation {} on channel {}",
                    channel.attenuation, channel.index
                ));
            }
        }

        if self.record.poll_interval_ms == 0 {
            return invalid("Invalid poll_interval_ms 0. Must be positive".to_string());
        }

        let bus = &self.bus;
        for (name, rate) in [
            ("uart_rate_hz", bus.uart_rate_hz),
            ("spi_rate_hz", bus.spi_rate_hz),
            ("i2c_rate_hz", bus.i2c_rate_hz),
            ("can_rate_hz", bus.can_rate_hz),
        ] {
            if !(rate > 0.0) {
                return invalid(format!("Invalid {name} {rate}. Must be positive"));
            }
        }

        Ok(())
    }
}

impl RecordConfig {
    /// Drain interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Recording duration as a [`Duration`].
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl BusConfig {
    /// Transfer timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl AnalogInConfig {
    /// Queue these settings on an oscilloscope.
    ///
    /// Values are snapped by the instrument like any other setter; the first
    /// rejected value aborts and is returned.
    pub fn apply(&self, scope: &mut AnalogIn) -> crate::Result<()> {
        scope.set_mode(self.mode)?;
        scope.set_sample_rate(self.sample_rate_hz)?;
        if let Some(samples) = self.buffer_size {
            scope.set_buffer_size(samples)?;
        }
        scope.set_oversample(self.oversample)?;
        scope.set_record_length(self.record_length_s)?;
        for channel in &self.channels {
            let selector = ChannelSelector::Index(channel.index);
            scope.set_channel_enable(selector, channel.enabled)?;
            scope.set_channel_range(selector, channel.range)?;
            scope.set_channel_offset(selector, channel.offset)?;
            scope.set_channel_attenuation(selector, channel.attenuation)?;
        }
        Ok(())
    }
}
