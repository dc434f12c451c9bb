//! Storage module for configuration and the known-device list.

pub mod config;
pub mod known_devices;

pub use config::{AppConfig, ConfigError};
pub use known_devices::{
    InMemoryKnownDevices, KnownDevice, KnownDeviceStore, SqliteKnownDevices, StorageError,
};
