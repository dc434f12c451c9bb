//! Control channel transport.
//!
//! The control engine never owns a device. It reads and writes
//! characteristics through a [`ControlTransport`] and listens for control
//! point indications on a broadcast channel fed by the notification pump.

use crate::sensors::types::SensorError;
use async_trait::async_trait;
use btleplug::api::{Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the control response channel.
pub const RESPONSE_CHANNEL_CAPACITY: usize = 32;

/// Characteristic access for one controllable device.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Read a characteristic.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, SensorError>;

    /// Write a characteristic with response.
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), SensorError>;

    /// Subscribe to control point indications.
    fn control_responses(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// Transport over a connected btleplug peripheral.
#[derive(Clone)]
pub struct PeripheralTransport {
    peripheral: Peripheral,
    responses: broadcast::Sender<Vec<u8>>,
}

impl PeripheralTransport {
    /// Wrap a peripheral. Indications must be fed in through the returned
    /// transport's [`PeripheralTransport::response_sender`].
    pub fn new(peripheral: Peripheral) -> Self {
        let (responses, _) = broadcast::channel(RESPONSE_CHANNEL_CAPACITY);
        Self {
            peripheral,
            responses,
        }
    }

    /// Sender the notification pump uses for control point indications.
    pub fn response_sender(&self) -> broadcast::Sender<Vec<u8>> {
        self.responses.clone()
    }

    fn characteristic(&self, uuid: Uuid) -> Result<btleplug::api::Characteristic, SensorError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(SensorError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl ControlTransport for PeripheralTransport {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, SensorError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .read(&c)
            .await
            .map_err(|e| SensorError::ReadFailed(e.to_string()))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), SensorError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .write(&c, data, WriteType::WithResponse)
            .await
            .map_err(|e| SensorError::WriteFailed(e.to_string()))
    }

    fn control_responses(&self) -> broadcast::Receiver<Vec<u8>> {
        self.responses.subscribe()
    }
}
