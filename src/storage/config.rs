//! Application configuration management.

use crate::recording::profile::UserProfile;
use crate::recording::types::RecorderConfig;
use crate::sensors::types::{ControlConfig, SensorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application version
    pub version: String,
    /// Data directory path
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Sensor link settings
    pub sensors: SensorSettings,
    /// Session recording settings
    pub recording: RecordingSettings,
    /// Trainer control settings
    pub control: ControlSettings,
    /// Rider profile
    pub profile: UserProfile,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::new(),
            sensors: SensorSettings::default(),
            recording: RecordingSettings::default(),
            control: ControlSettings::default(),
            profile: UserProfile::default(),
        }
    }
}

impl AppConfig {
    /// Location of the known-device database.
    pub fn known_devices_path(&self) -> PathBuf {
        self.data_dir.join("known_devices.db")
    }
}

/// Sensor-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Auto-reconnect on disconnect
    pub auto_reconnect: bool,
    /// Discovery timeout in seconds
    pub discovery_timeout_secs: u32,
    /// Connection timeout in seconds
    pub connection_timeout_secs: u32,
    /// Debounce for link state transitions
    pub debounce_ms: u64,
    /// Age after which a queued transition is dropped
    pub freshness_ms: u64,
    /// Health check period in seconds
    pub health_check_interval_secs: u32,
    /// Silence before a connected device is considered dead
    pub data_timeout_secs: u32,
    /// First reconnection delay
    pub reconnect_base_ms: u64,
    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            discovery_timeout_secs: 30,
            connection_timeout_secs: 10,
            debounce_ms: 500,
            freshness_ms: 2000,
            health_check_interval_secs: 15,
            data_timeout_secs: 60,
            reconnect_base_ms: 1000,
            max_reconnect_attempts: 8,
        }
    }
}

impl From<&SensorSettings> for SensorConfig {
    fn from(s: &SensorSettings) -> Self {
        Self {
            discovery_timeout: Duration::from_secs(s.discovery_timeout_secs.into()),
            connection_timeout: Duration::from_secs(s.connection_timeout_secs.into()),
            auto_reconnect: s.auto_reconnect,
            debounce: Duration::from_millis(s.debounce_ms),
            freshness: Duration::from_millis(s.freshness_ms),
            health_check_interval: Duration::from_secs(s.health_check_interval_secs.into()),
            data_timeout: Duration::from_secs(s.data_timeout_secs.into()),
            reconnect_base: Duration::from_millis(s.reconnect_base_ms),
            max_reconnect_attempts: s.max_reconnect_attempts,
        }
    }
}

/// Recording-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Statistics tick in milliseconds
    pub fast_tick_ms: u64,
    /// Flush interval in seconds
    pub persistence_interval_secs: u32,
    /// Reading buffer retention in seconds
    pub retention_secs: u32,
    /// Minimum spacing between reading events
    pub reading_event_interval_ms: u64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            fast_tick_ms: 1000,
            persistence_interval_secs: 120,
            retention_secs: 60,
            reading_event_interval_ms: 100,
        }
    }
}

impl From<&RecordingSettings> for RecorderConfig {
    fn from(s: &RecordingSettings) -> Self {
        Self {
            fast_tick: Duration::from_millis(s.fast_tick_ms.max(1)),
            persistence_interval: Duration::from_secs(s.persistence_interval_secs.max(1).into()),
            retention: Duration::from_secs(s.retention_secs.into()),
            reading_event_interval: Duration::from_millis(s.reading_event_interval_ms),
        }
    }
}

/// Trainer control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub settle_ms: u64,
    pub guard_timeout_secs: u32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2000,
            max_retries: 3,
            retry_base_ms: 500,
            settle_ms: 1000,
            guard_timeout_secs: 15,
        }
    }
}

impl From<&ControlSettings> for ControlConfig {
    fn from(s: &ControlSettings) -> Self {
        Self {
            ack_timeout: Duration::from_millis(s.ack_timeout_ms),
            max_retries: s.max_retries,
            retry_base: Duration::from_millis(s.retry_base_ms),
            settle: Duration::from_millis(s.settle_ms),
            guard_timeout: Duration::from_secs(s.guard_timeout_secs.into()),
        }
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "ridelink", "RideLink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the configuration file path.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load application configuration from the default location.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut config = load_config_from(&get_config_path())?;
    config.data_dir = get_data_dir();
    Ok(config)
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist. The data directory is set to the file's directory.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let data_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    if !path.exists() {
        return Ok(AppConfig {
            data_dir,
            ..Default::default()
        });
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    let mut config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.data_dir = data_dir;
    Ok(config)
}

/// Save application configuration to the default location.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path())
}

/// Save configuration to `path`, creating parent directories.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::profile::Environment;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.sensors.debounce_ms, 500);
        assert_eq!(config.recording.persistence_interval_secs, 120);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.profile.ftp_watts = Some(260);
        config.profile.environment = Environment::Outdoor;
        config.control.max_retries = 5;
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.profile.ftp_watts, Some(260));
        assert_eq!(loaded.profile.environment, Environment::Outdoor);
        assert_eq!(loaded.control.max_retries, 5);

        std::fs::write(&path, "[recording]\npersistence_interval_secs = 30\n").unwrap();
        let partial = load_config_from(&path).unwrap();
        assert_eq!(partial.recording.persistence_interval_secs, 30);
        assert_eq!(partial.recording.fast_tick_ms, 1000);
        assert!(partial.sensors.auto_reconnect);
    }

    #[test]
    fn test_settings_convert_to_runtime_config() {
        let sensors = SensorConfig::from(&SensorSettings::default());
        assert_eq!(sensors.reconnect_base, Duration::from_secs(1));
        assert_eq!(sensors.max_reconnect_attempts, 8);

        let control = ControlConfig::from(&ControlSettings::default());
        assert_eq!(control.ack_timeout, Duration::from_secs(2));
        assert_eq!(control.settle, Duration::from_secs(1));

        let recorder = RecorderConfig::from(&RecordingSettings::default());
        assert_eq!(recorder.persistence_interval, Duration::from_secs(120));
    }
}
