//! Durable list of devices that connected successfully.
//!
//! Entries are written when a link reaches `Connected` and removed only on an
//! explicit user disconnect. A later process start reads the list to retry
//! connecting proactively.

use crate::sensors::types::SensorType;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const KNOWN_DEVICES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS known_devices (
    device_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    sensor_type TEXT,
    last_connected_at TEXT NOT NULL
);
"#;

/// A device remembered across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDevice {
    pub device_id: String,
    pub name: String,
    pub sensor_type: Option<SensorType>,
    pub last_connected: DateTime<Utc>,
}

impl KnownDevice {
    pub fn new(
        device_id: impl Into<String>,
        name: impl Into<String>,
        sensor_type: Option<SensorType>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            sensor_type,
            last_connected: Utc::now(),
        }
    }
}

/// Storage for the known-device list.
pub trait KnownDeviceStore: Send + Sync {
    /// Insert or refresh a device.
    fn remember(&self, device: &KnownDevice) -> Result<(), StorageError>;

    /// Remove a device. Removing an unknown id is not an error.
    fn forget(&self, device_id: &str) -> Result<(), StorageError>;

    /// All devices, most recently connected first.
    fn list(&self) -> Result<Vec<KnownDevice>, StorageError>;
}

fn sensor_type_key(sensor_type: SensorType) -> &'static str {
    match sensor_type {
        SensorType::Trainer => "trainer",
        SensorType::PowerMeter => "power_meter",
        SensorType::HeartRate => "heart_rate",
        SensorType::SpeedCadence => "speed_cadence",
    }
}

fn parse_sensor_type(key: &str) -> Result<SensorType, StorageError> {
    match key {
        "trainer" => Ok(SensorType::Trainer),
        "power_meter" => Ok(SensorType::PowerMeter),
        "heart_rate" => Ok(SensorType::HeartRate),
        "speed_cadence" => Ok(SensorType::SpeedCadence),
        other => Err(StorageError::Deserialization(format!(
            "Unknown sensor type: {other}"
        ))),
    }
}

struct KnownDeviceRow {
    device_id: String,
    name: String,
    sensor_type: Option<String>,
    last_connected_at: String,
}

impl KnownDeviceRow {
    fn into_known_device(self) -> Result<KnownDevice, StorageError> {
        let sensor_type = self
            .sensor_type
            .as_deref()
            .map(parse_sensor_type)
            .transpose()?;

        let last_connected = DateTime::parse_from_rfc3339(&self.last_connected_at)
            .map_err(|e| StorageError::Deserialization(format!("Invalid timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(KnownDevice {
            device_id: self.device_id,
            name: self.name,
            sensor_type,
            last_connected,
        })
    }
}

/// SQLite-backed known-device store.
pub struct SqliteKnownDevices {
    conn: Mutex<Connection>,
}

impl SqliteKnownDevices {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let conn =
            Connection::open(path).map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        Self::initialize(conn)
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(KNOWN_DEVICES_TABLE)
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KnownDeviceStore for SqliteKnownDevices {
    fn remember(&self, device: &KnownDevice) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO known_devices
                 (device_id, name, sensor_type, last_connected_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    device.device_id,
                    device.name,
                    device.sensor_type.map(sensor_type_key),
                    device
                        .last_connected
                        .to_rfc3339_opts(SecondsFormat::Micros, true),
                ],
            )
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        tracing::debug!("Remembered device {}", device.device_id);
        Ok(())
    }

    fn forget(&self, device_id: &str) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "DELETE FROM known_devices WHERE device_id = ?1",
                params![device_id],
            )
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<KnownDevice>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT device_id, name, sensor_type, last_connected_at
                 FROM known_devices ORDER BY last_connected_at DESC",
            )
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(KnownDeviceRow {
                    device_id: row.get(0)?,
                    name: row.get(1)?,
                    sensor_type: row.get(2)?,
                    last_connected_at: row.get(3)?,
                })
            })
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let mut devices = Vec::new();
        for row in rows {
            let row = row.map_err(|e| StorageError::QueryFailed(e.to_string()))?;
            devices.push(row.into_known_device()?);
        }
        Ok(devices)
    }
}

/// Known-device store kept in memory, for tests and headless runs.
#[derive(Debug, Default)]
pub struct InMemoryKnownDevices {
    devices: Mutex<HashMap<String, KnownDevice>>,
}

impl InMemoryKnownDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<String, KnownDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KnownDeviceStore for InMemoryKnownDevices {
    fn remember(&self, device: &KnownDevice) -> Result<(), StorageError> {
        self.devices()
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    fn forget(&self, device_id: &str) -> Result<(), StorageError> {
        self.devices().remove(device_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<KnownDevice>, StorageError> {
        let mut devices: Vec<KnownDevice> = self.devices().values().cloned().collect();
        devices.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
        Ok(devices)
    }
}

/// Known-device storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open store: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
