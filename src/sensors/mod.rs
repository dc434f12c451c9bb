//! Sensor module: BLE ingestion, link supervision and FTMS trainer control.

pub mod control;
pub mod ftms;
pub mod gatt;
pub mod link;
pub mod manager;
pub mod mock;
pub mod trainers;
pub mod transport;
pub mod types;

pub use control::FtmsController;
pub use ftms::{ControlMode, FeatureSet, ResultCode, SimulationParams, SupportedRange};
pub use link::{DeviceConnector, LinkSupervisor};
pub use manager::SensorManager;
pub use trainers::{GattSource, TrainerControls};
pub use transport::{ControlTransport, PeripheralTransport};
pub use types::{
    ConnectionState, ControlConfig, ControlError, ControlEvent, ControlKind, DeviceRecord,
    DiscoveredSensor, Protocol, SensorConfig, SensorError, SensorEvent, SensorType,
};
