//! Session configuration management

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for a USB session
///
/// # Example Configuration
/// ```toml
/// close_grace_ms = 500
/// event_poll_interval_ms = 50
/// hotplug_channel_capacity = 64
/// log_level = "debug"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long `close()` keeps draining before finishing leftovers as closed
    #[serde(default = "SessionConfig::default_close_grace")]
    pub close_grace_ms: u64,
    /// Upper bound on one event-thread wait, so stop requests are noticed
    #[serde(default = "SessionConfig::default_poll_interval")]
    pub event_poll_interval_ms: u64,
    /// Bound of hot-plug notification channels
    #[serde(default = "SessionConfig::default_channel_capacity")]
    pub hotplug_channel_capacity: usize,
    /// Default log filter used by `setup_logging`
    #[serde(default = "SessionConfig::default_log_level")]
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_grace_ms: Self::default_close_grace(),
            event_poll_interval_ms: Self::default_poll_interval(),
            hotplug_channel_capacity: Self::default_channel_capacity(),
            log_level: Self::default_log_level(),
        }
    }
}

impl SessionConfig {
    fn default_close_grace() -> u64 {
        1000
    }

    fn default_poll_interval() -> u64 {
        100
    }

    fn default_channel_capacity() -> usize {
        256
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };

        let content = fs::read_to_string(&config_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-session").join("session.toml")
        } else {
            PathBuf::from(".config/usb-session/session.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.event_poll_interval_ms == 0 {
            return Err(Error::Config(
                "event_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.hotplug_channel_capacity == 0 {
            return Err(Error::Config(
                "hotplug_channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.close_grace(), Duration::from_secs(1));
        assert_eq!(config.event_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.hotplug_channel_capacity, 256);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SessionConfig::from_toml_str("close_grace_ms = 250\n").unwrap();
        assert_eq!(config.close_grace_ms, 250);
        assert_eq!(config.event_poll_interval_ms, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SessionConfig::from_toml_str("event_poll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = SessionConfig::from_toml_str("close_grace_ms = \"soon\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.toml");

        let config = SessionConfig {
            close_grace_ms: 50,
            event_poll_interval_ms: 10,
            hotplug_channel_capacity: 8,
            log_level: "debug".to_string(),
        };
        config.save(&path).unwrap();

        let loaded = SessionConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
