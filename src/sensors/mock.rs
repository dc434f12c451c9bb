//! Mock collaborators for testing without Bluetooth hardware.
//!
//! [`MockTransport`] answers control point writes according to a scripted
//! [`AckBehavior`]; [`MockConnector`] succeeds or fails connection attempts
//! on demand.

use crate::sensors::ftms::{FTMS_CONTROL_POINT_UUID, FTMS_FEATURE_UUID};
use crate::sensors::link::DeviceConnector;
use crate::sensors::transport::{ControlTransport, RESPONSE_CHANNEL_CAPACITY};
use crate::sensors::types::SensorError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// How the mock answers a control point write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    /// Echo the opcode with a success result
    Success,
    /// Echo the opcode with the given result code
    Result(u8),
    /// Answer with a success for a different opcode
    WrongOpcode,
    /// Never answer
    Silent,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scriptable control transport.
#[derive(Debug)]
pub struct MockTransport {
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    behavior: Mutex<AckBehavior>,
    scripted: Mutex<VecDeque<AckBehavior>>,
    failing_writes: AtomicU32,
    responses: broadcast::Sender<Vec<u8>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (responses, _) = broadcast::channel(RESPONSE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            behavior: Mutex::new(AckBehavior::Success),
            scripted: Mutex::new(VecDeque::new()),
            failing_writes: AtomicU32::new(0),
            responses,
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose feature characteristic holds the given words.
    pub fn with_features(machine: u32, targets: u32) -> Self {
        let transport = Self::new();
        let mut data = machine.to_le_bytes().to_vec();
        data.extend_from_slice(&targets.to_le_bytes());
        transport.set_value(FTMS_FEATURE_UUID, data);
        transport
    }

    /// Set the bytes returned when `uuid` is read.
    pub fn set_value(&self, uuid: Uuid, data: Vec<u8>) {
        lock(&self.values).insert(uuid, data);
    }

    /// Default answer for writes with no scripted behavior.
    pub fn set_behavior(&self, behavior: AckBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Queue a one-shot answer for the next write.
    pub fn push_behavior(&self, behavior: AckBehavior) {
        lock(&self.scripted).push_back(behavior);
    }

    /// Make the next `n` writes fail in transport.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Every write, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    /// Payloads written to the control point.
    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes)
            .iter()
            .filter(|(uuid, _)| *uuid == FTMS_CONTROL_POINT_UUID)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Push a raw indication to listeners.
    pub fn indicate(&self, data: Vec<u8>) {
        let _ = self.responses.send(data);
    }
}

#[async_trait]
impl ControlTransport for MockTransport {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, SensorError> {
        lock(&self.values)
            .get(&characteristic)
            .cloned()
            .ok_or(SensorError::CharacteristicNotFound(characteristic))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), SensorError> {
        lock(&self.writes).push((characteristic, data.to_vec()));

        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(SensorError::WriteFailed("simulated write failure".to_string()));
        }

        if characteristic != FTMS_CONTROL_POINT_UUID {
            return Ok(());
        }

        let opcode = data.first().copied().unwrap_or_default();
        let behavior = lock(&self.scripted)
            .pop_front()
            .unwrap_or(*lock(&self.behavior));

        match behavior {
            AckBehavior::Success => self.indicate(vec![0x80, opcode, 0x01]),
            AckBehavior::Result(code) => self.indicate(vec![0x80, opcode, code]),
            AckBehavior::WrongOpcode => self.indicate(vec![0x80, opcode ^ 0x7F, 0x01]),
            AckBehavior::Silent => {}
        }
        Ok(())
    }

    fn control_responses(&self) -> broadcast::Receiver<Vec<u8>> {
        self.responses.subscribe()
    }
}

/// Connector whose outcomes are scripted.
#[derive(Debug, Default)]
pub struct MockConnector {
    outcomes: Mutex<VecDeque<bool>>,
    succeed_by_default: Mutex<bool>,
    delay: Mutex<Duration>,
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<String>>,
}

impl MockConnector {
    /// Connector where every attempt succeeds.
    pub fn succeeding() -> Self {
        let connector = Self::default();
        connector.set_default(true);
        connector
    }

    /// Connector where every attempt fails.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn set_default(&self, succeed: bool) {
        *lock(&self.succeed_by_default) = succeed;
    }

    /// Make every attempt take `delay` before it resolves.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Queue a one-shot outcome for the next attempt.
    pub fn push_outcome(&self, succeed: bool) {
        lock(&self.outcomes).push_back(succeed);
    }

    /// Device ids passed to `connect`, in order.
    pub fn connect_attempts(&self) -> Vec<String> {
        lock(&self.connects).clone()
    }

    /// Device ids passed to `disconnect`, in order.
    pub fn disconnects(&self) -> Vec<String> {
        lock(&self.disconnects).clone()
    }
}

#[async_trait]
impl DeviceConnector for MockConnector {
    async fn connect(&self, device_id: &str) -> Result<(), SensorError> {
        lock(&self.connects).push(device_id.to_string());
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let succeed = lock(&self.outcomes)
            .pop_front()
            .unwrap_or(*lock(&self.succeed_by_default));

        if succeed {
            Ok(())
        } else {
            Err(SensorError::ConnectionFailed(format!("{device_id} unreachable")))
        }
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), SensorError> {
        lock(&self.disconnects).push(device_id.to_string());
        Ok(())
    }
}
