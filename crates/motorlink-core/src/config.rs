/*!
 * Configuration management for motorlink.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for motorlink components.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::millis;

/// Core configuration for motorlink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Link transport configuration
    #[serde(default)]
    pub link: LinkConfig,

    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Per-motor state configuration
    #[serde(default)]
    pub motor: MotorConfig,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to print the event target
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Whether to use ANSI colors
    #[serde(default = "default_true")]
    pub ansi: bool,
}

/// Link transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Baud rate used for operational links
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// How long the drain loop waits for a response after each frame
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Baud rate used while probing a candidate link
    #[serde(default = "default_baud_rate")]
    pub probe_baud_rate: u32,

    /// How long to wait for probe responses on a link
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Maximum number of passes when retrying
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Per-motor state configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Heartbeat period
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive heartbeat failures before a motor is declared offline
    #[serde(default = "default_heartbeat_failure_threshold")]
    pub heartbeat_failure_threshold: u32,

    /// Default auto-poll period for actual values
    #[serde(default = "default_auto_poll_interval_ms")]
    pub auto_poll_interval_ms: u64,

    /// Number of error codes kept per motor
    #[serde(default = "default_error_history_len")]
    pub error_history_len: usize,

    /// Timeout of a single calibration or homing step
    #[serde(default = "default_procedure_step_timeout_ms")]
    pub procedure_step_timeout_ms: u64,

    /// Directory holding persisted parameter documents
    #[serde(default = "default_params_dir")]
    pub params_dir: String,

    /// Request every value from a motor once it is registered
    #[serde(default = "default_true")]
    pub request_all_on_register: bool,
}

impl LinkConfig {
    /// Response timeout as a duration
    pub fn response_timeout(&self) -> Duration {
        millis(self.response_timeout_ms)
    }
}

impl DiscoveryConfig {
    /// Probe timeout as a duration
    pub fn probe_timeout(&self) -> Duration {
        millis(self.probe_timeout_ms)
    }
}

impl MotorConfig {
    /// Heartbeat period as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        millis(self.heartbeat_interval_ms)
    }

    /// Auto-poll period as a duration
    pub fn auto_poll_interval(&self) -> Duration {
        millis(self.auto_poll_interval_ms)
    }

    /// Procedure step timeout as a duration
    pub fn procedure_step_timeout(&self) -> Duration {
        millis(self.procedure_step_timeout_ms)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            ansi: true,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_baud_rate: default_baud_rate(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_failure_threshold: default_heartbeat_failure_threshold(),
            auto_poll_interval_ms: default_auto_poll_interval_ms(),
            error_history_len: default_error_history_len(),
            procedure_step_timeout_ms: default_procedure_step_timeout_ms(),
            params_dir: default_params_dir(),
            request_all_on_register: true,
        }
    }
}

fn default_app_name() -> String {
    "motorlink".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    1_500_000
}

fn default_response_timeout_ms() -> u64 {
    20
}

fn default_probe_timeout_ms() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_failure_threshold() -> u32 {
    3
}

fn default_auto_poll_interval_ms() -> u64 {
    100
}

fn default_error_history_len() -> usize {
    20
}

fn default_procedure_step_timeout_ms() -> u64 {
    5000
}

fn default_params_dir() -> String {
    "./data/params".to_string()
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML text
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the device layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.link.baud_rate == 0 || self.discovery.probe_baud_rate == 0 {
            return Err(Error::config("baud rates must be non-zero"));
        }
        if self.discovery.max_attempts == 0 {
            return Err(Error::config("discovery.max_attempts must be at least 1"));
        }
        if self.motor.heartbeat_failure_threshold == 0 {
            return Err(Error::config(
                "motor.heartbeat_failure_threshold must be at least 1",
            ));
        }
        if self.motor.heartbeat_interval_ms == 0 || self.motor.auto_poll_interval_ms == 0 {
            return Err(Error::config("timer intervals must be non-zero"));
        }
        if self.motor.error_history_len == 0 {
            return Err(Error::config("motor.error_history_len must be at least 1"));
        }
        Ok(())
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
