/*!
 * Configuration management for vidhub.
 *
 * This module provides functionality to load and access configuration
 * settings for vidhub components: defaults, an optional file, then
 * environment variables.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for vidhub
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "vidhub_devices=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_log_target")]
    pub with_target: bool,
}

/// Device connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// TCP port used when a device address has none
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Bound on waiting for a device's prelude after connecting
    #[serde(default = "default_prelude_timeout_ms")]
    pub prelude_timeout_ms: u64,

    /// Bound on waiting for the ACK or NAK of a command
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Poll interval of connection mirrors
    #[serde(default = "default_mirror_poll_ms")]
    pub mirror_poll_ms: u64,
}

impl ConnectionConfig {
    /// Prelude timeout as a duration
    pub fn prelude_timeout(&self) -> Duration {
        Duration::from_millis(self.prelude_timeout_ms)
    }

    /// ACK timeout as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Mirror poll interval as a duration
    pub fn mirror_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mirror_poll_ms)
    }
}

impl Config {
    /// Render the configuration as TOML, e.g. to write a starter file
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_log_target(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            prelude_timeout_ms: default_prelude_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            mirror_poll_ms: default_mirror_poll_ms(),
        }
    }
}

fn default_app_name() -> String {
    "vidhub".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_target() -> bool {
    true
}

fn default_port() -> u16 {
    9990
}

fn default_prelude_timeout_ms() -> u64 {
    10_000
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_mirror_poll_ms() -> u64 {
    1_000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
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

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

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

        // Missing keys fall back to the serde defaults.
        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "vidhub");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.connection.default_port, 9990);
        assert_eq!(config.connection.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.mirror_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "vidhub");
        assert_eq!(config.connection.prelude_timeout_ms, 10_000);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir().map_err(|e| Error::other(e.to_string()))?;
        let file_path = dir.path().join("config.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                app_name = "studio-a"

                [connection]
                ack_timeout_ms = 250
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert_eq!(config.general.app_name, "studio-a");
        assert_eq!(config.connection.ack_timeout_ms, 250);
        assert_eq!(config.connection.default_port, 9990);

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("VIDHUBTEST__CONNECTION__DEFAULT_PORT", "9991");

        let config = ConfigBuilder::new()
            .with_environment_prefix("vidhubtest")
            .build()?;

        assert_eq!(config.connection.default_port, 9991);

        env::remove_var("VIDHUBTEST__CONNECTION__DEFAULT_PORT");

        Ok(())
    }

    #[test]
    fn test_toml_output_reloads() -> Result<()> {
        let mut config = Config::default();
        config.connection.prelude_timeout_ms = 1234;
        let rendered = config.to_toml_string()?;
        assert!(rendered.contains("prelude_timeout_ms = 1234"));

        let dir = tempdir().map_err(|e| Error::other(e.to_string()))?;
        let file_path = dir.path().join("vidhub.toml");
        std::fs::write(&file_path, rendered)?;
        let loaded = ConfigBuilder::new().with_config_file(&file_path).build()?;
        assert_eq!(loaded.connection.prelude_timeout_ms, 1234);

        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "vidhub");
    }
}
