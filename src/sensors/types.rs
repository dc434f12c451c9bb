//! Sensor types: device records, link states, events, configuration and
//! errors for BLE fitness sensors and trainer control.

use crate::clock::Timestamp;
use crate::recording::types::Sample;
use crate::sensors::ftms::{ControlMode, FeatureSet, ResultCode};
use crate::storage::known_devices::StorageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Type of fitness sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    /// Smart trainer with FTMS support
    Trainer,
    /// Standalone power meter
    PowerMeter,
    /// Heart rate monitor
    HeartRate,
    /// Combined speed/cadence sensor
    SpeedCadence,
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorType::Trainer => write!(f, "Smart Trainer"),
            SensorType::PowerMeter => write!(f, "Power Meter"),
            SensorType::HeartRate => write!(f, "Heart Rate"),
            SensorType::SpeedCadence => write!(f, "Speed/Cadence"),
        }
    }
}

/// BLE communication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// BLE Fitness Machine Service (0x1826)
    BleFtms,
    /// BLE Cycling Power Service (0x1818)
    BleCyclingPower,
    /// BLE Heart Rate Service (0x180D)
    BleHeartRate,
    /// BLE Cycling Speed and Cadence (0x1816)
    BleCsc,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::BleFtms => write!(f, "FTMS"),
            Protocol::BleCyclingPower => write!(f, "Cycling Power"),
            Protocol::BleHeartRate => write!(f, "Heart Rate"),
            Protocol::BleCsc => write!(f, "Cycling Speed/Cadence"),
        }
    }
}

/// Link state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Active connection
    Connected,
    /// Reconnection exhausted; needs caller action
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Failed)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// A sensor discovered during BLE scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredSensor {
    /// BLE device address/identifier
    pub device_id: String,
    /// User-friendly name (from BLE advertisement)
    pub name: String,
    /// Detected sensor type
    pub sensor_type: SensorType,
    /// Communication protocol
    pub protocol: Protocol,
    /// Signal strength (RSSI)
    pub signal_strength: Option<i16>,
}

/// Live record of a device, owned by the link supervisor.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// BLE device address/identifier
    pub device_id: String,
    /// User-friendly name
    pub name: String,
    /// Type of sensor, once known
    pub sensor_type: Option<SensorType>,
    /// Characteristics subscribed to on connect
    pub characteristics: Vec<Uuid>,
    /// Current link state
    pub state: ConnectionState,
    /// When data was last received
    pub last_data_at: Option<Timestamp>,
    /// Control features, for controllable devices
    pub control: Option<FeatureSet>,
    /// Battery level percentage (0-100)
    pub battery_level: Option<u8>,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            sensor_type: None,
            characteristics: Vec::new(),
            state: ConnectionState::Disconnected,
            last_data_at: None,
            control: None,
            battery_level: None,
        }
    }
}

/// Events from the sensor system.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// A new sensor was discovered during scanning
    Discovered(DiscoveredSensor),
    /// Link state changed
    ConnectionChanged {
        device_id: String,
        state: ConnectionState,
    },
    /// A reading arrived
    Reading { device_id: String, sample: Sample },
    /// Battery level updated
    Battery { device_id: String, level: u8 },
    /// A reconnection attempt is scheduled
    ReconnectScheduled {
        device_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Scan started
    ScanStarted,
    /// Scan stopped
    ScanStopped,
}

/// Configuration for the sensor manager and link supervisor.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Timeout for discovery scan
    pub discovery_timeout: Duration,
    /// Timeout for a single connection attempt
    pub connection_timeout: Duration,
    /// Whether to reconnect on link loss
    pub auto_reconnect: bool,
    /// Debounce applied to requested transitions
    pub debounce: Duration,
    /// Queued transitions older than this are dropped
    pub freshness: Duration,
    /// Period of the health check
    pub health_check_interval: Duration,
    /// Silence after which a connected device is considered dead
    pub data_timeout: Duration,
    /// First reconnection delay; doubles per attempt
    pub reconnect_base: Duration,
    /// Maximum reconnection attempts
    pub max_reconnect_attempts: u32,
}

impl SensorConfig {
    /// Delay before reconnection `attempt` (1-based): `base × 2^(attempt-1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.reconnect_base.saturating_mul(1u32 << exponent)
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            debounce: Duration::from_millis(500),
            freshness: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(15),
            data_timeout: Duration::from_secs(60),
            reconnect_base: Duration::from_secs(1),
            max_reconnect_attempts: 8,
        }
    }
}

/// Configuration for a trainer control engine.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How long to wait for a matching acknowledgement
    pub ack_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First retry delay; doubles per retry
    pub retry_base: Duration,
    /// Guard hold time after an exchange completes
    pub settle: Duration,
    /// Minimum hold before the watchdog frees the guard; raised to cover
    /// the worst-case exchange, see [`ControlConfig::guard_ceiling`]
    pub guard_timeout: Duration,
}

impl ControlConfig {
    /// Delay before retry `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.retry_base.saturating_mul(1u32 << exponent)
    }

    /// Longest one exchange can run when every attempt times out and every
    /// retry waits out its backoff.
    pub fn exchange_budget(&self) -> Duration {
        let backoff = (1..=self.max_retries)
            .fold(Duration::ZERO, |total, n| total.saturating_add(self.retry_delay(n)));
        self.ack_timeout
            .saturating_mul(self.max_retries.saturating_add(1))
            .saturating_add(backoff)
    }

    /// When the watchdog frees the guard. Never earlier than a mode switch,
    /// a reset and a target exchange both run to exhaustion, plus the settle.
    pub fn guard_ceiling(&self) -> Duration {
        let mode_switch = self
            .exchange_budget()
            .saturating_mul(2)
            .saturating_add(self.settle);
        self.guard_timeout.max(mode_switch)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            max_retries: 3,
            retry_base: Duration::from_millis(500),
            settle: Duration::from_secs(1),
            guard_timeout: Duration::from_secs(15),
        }
    }
}

/// Kind of control exchange recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    RequestControl,
    Reset,
    Start,
    Stop,
    Target(ControlMode),
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlKind::RequestControl => write!(f, "request control"),
            ControlKind::Reset => write!(f, "reset"),
            ControlKind::Start => write!(f, "start"),
            ControlKind::Stop => write!(f, "stop"),
            ControlKind::Target(mode) => write!(f, "{mode} target"),
        }
    }
}

/// Audit log entry for one control exchange. Never mutated once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: ControlKind,
    pub requested_value: Option<f64>,
    pub success: bool,
    pub reason: Option<String>,
}

/// Errors that can occur in the sensor system.
#[derive(Debug, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Failed to start BLE scanning
    #[error("Failed to start scanning: {0}")]
    ScanFailed(String),

    /// Sensor not found with given device ID
    #[error("Sensor not found: {0}")]
    SensorNotFound(String),

    /// Connection to sensor failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timed out
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// Failed to subscribe to sensor notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// Characteristic not present on the device
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// Read from a characteristic failed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Failed to write to sensor characteristic
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Requested link transition is not in the transition table
    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Generic BLE error
    #[error("BLE error: {0}")]
    BleError(String),

    /// Known-device storage failed
    #[error("Known device storage: {0}")]
    Storage(#[from] StorageError),
}

impl From<btleplug::Error> for SensorError {
    fn from(e: btleplug::Error) -> Self {
        SensorError::BleError(e.to_string())
    }
}

/// Errors from the trainer control engine.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Another command holds the single-flight guard
    #[error("Control channel busy, try again shortly")]
    Busy,

    /// The device does not advertise this capability
    #[error("Capability not supported by device: {0}")]
    Unsupported(ControlMode),

    /// Features have not been read yet
    #[error("Control features not discovered")]
    NotDiscovered,

    /// Every attempt timed out or failed in transport
    #[error("all retries failed")]
    RetriesExhausted,

    /// The device answered with a failure result
    #[error("Device rejected command: {0}")]
    Rejected(ResultCode),

    /// Transport-level failure outside the retry loop
    #[error("Transport error: {0}")]
    Transport(#[from] SensorError),
}
