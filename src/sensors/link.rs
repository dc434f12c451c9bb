//! Device link supervision.
//!
//! [`LinkSupervisor`] owns every [`DeviceRecord`] and drives it through the
//! connection state machine: immediate and debounced transitions, data-driven
//! revival, a periodic health check, and exponential-backoff reconnection.
//! Successful connections are remembered in a [`KnownDeviceStore`].

use crate::clock::{MonotonicClock, Timestamp};
use crate::events::{EventBus, Subscription};
use crate::sensors::ftms::FeatureSet;
use crate::sensors::types::{
    ConnectionState, DeviceRecord, SensorConfig, SensorError, SensorEvent, SensorType,
};
use crate::storage::known_devices::{KnownDevice, KnownDeviceStore, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Establishes and tears down the physical link to a device.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Connect and subscribe to the device's characteristics.
    async fn connect(&self, device_id: &str) -> Result<(), SensorError>;

    /// Drop the physical link.
    async fn disconnect(&self, device_id: &str) -> Result<(), SensorError>;
}

struct DeviceSlot {
    record: DeviceRecord,
    connected_at: Option<Timestamp>,
    pending: Option<JoinHandle<()>>,
    queued: Option<(ConnectionState, Instant)>,
    reconnect: Option<JoinHandle<()>>,
}

impl DeviceSlot {
    fn new(record: DeviceRecord) -> Self {
        Self {
            record,
            connected_at: None,
            pending: None,
            queued: None,
            reconnect: None,
        }
    }

    fn cancel_debounce(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.queued = None;
    }

    fn cancel_reconnect(&mut self) -> bool {
        match self.reconnect.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }
}

struct LinkInner {
    config: SensorConfig,
    connector: Arc<dyn DeviceConnector>,
    known: Arc<dyn KnownDeviceStore>,
    clock: MonotonicClock,
    events: Arc<EventBus<SensorEvent>>,
    slots: Mutex<HashMap<String, DeviceSlot>>,
    health: Mutex<Option<JoinHandle<()>>>,
}

/// Supervises the link state of every device.
#[derive(Clone)]
pub struct LinkSupervisor {
    inner: Arc<LinkInner>,
}

impl LinkSupervisor {
    pub fn new(
        config: SensorConfig,
        connector: Arc<dyn DeviceConnector>,
        known: Arc<dyn KnownDeviceStore>,
        clock: MonotonicClock,
        events: Arc<EventBus<SensorEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                connector,
                known,
                clock,
                events,
                slots: Mutex::new(HashMap::new()),
                health: Mutex::new(None),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, DeviceSlot>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SensorConfig {
        &self.inner.config
    }

    /// Subscribe to sensor events.
    pub fn subscribe(&self) -> Subscription<SensorEvent> {
        self.inner.events.subscribe()
    }

    /// Start tracking a device. An already tracked device is left untouched.
    pub fn add_device(&self, record: DeviceRecord) {
        self.slots()
            .entry(record.device_id.clone())
            .or_insert_with(|| DeviceSlot::new(record));
    }

    pub fn record(&self, device_id: &str) -> Option<DeviceRecord> {
        self.slots().get(device_id).map(|s| s.record.clone())
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.slots().values().map(|s| s.record.clone()).collect()
    }

    pub fn state(&self, device_id: &str) -> Option<ConnectionState> {
        self.slots().get(device_id).map(|s| s.record.state)
    }

    /// Record what connecting learned about a device.
    pub fn set_sensor_info(
        &self,
        device_id: &str,
        sensor_type: Option<SensorType>,
        characteristics: Vec<Uuid>,
    ) {
        if let Some(slot) = self.slots().get_mut(device_id) {
            if sensor_type.is_some() {
                slot.record.sensor_type = sensor_type;
            }
            slot.record.characteristics = characteristics;
        }
    }

    pub fn set_control_features(&self, device_id: &str, features: FeatureSet) {
        if let Some(slot) = self.slots().get_mut(device_id) {
            slot.record.control = Some(features);
        }
    }

    pub fn update_battery(&self, device_id: &str, level: u8) {
        let known = match self.slots().get_mut(device_id) {
            Some(slot) => {
                slot.record.battery_level = Some(level);
                true
            }
            None => false,
        };

        if known {
            self.inner.events.publish(SensorEvent::Battery {
                device_id: device_id.to_string(),
                level,
            });
        }
    }

    /// Apply a transition without debounce. Cancels any pending debounced
    /// transition for the device.
    pub fn transition_now(
        &self,
        device_id: &str,
        target: ConnectionState,
    ) -> Result<(), SensorError> {
        match self.slots().get_mut(device_id) {
            Some(slot) => slot.cancel_debounce(),
            None => return Err(SensorError::SensorNotFound(device_id.to_string())),
        }
        self.apply(device_id, target)
    }

    /// Request a debounced transition.
    ///
    /// The first request starts the debounce timer. Requests arriving while
    /// it runs replace the queued slot and are applied after the timer only
    /// if still fresh.
    pub fn request_transition(&self, device_id: &str, target: ConnectionState) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(device_id) else {
            tracing::warn!("Transition requested for unknown device {}", device_id);
            return;
        };

        if slot.pending.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Queued {} for {} behind pending transition", target, device_id);
            slot.queued = Some((target, Instant::now()));
            return;
        }

        let link = self.clone();
        let id = device_id.to_string();
        let debounce = self.inner.config.debounce;
        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            link.complete_debounce(&id, target);
        }));
    }

    fn complete_debounce(&self, device_id: &str, target: ConnectionState) {
        let queued = match self.slots().get_mut(device_id) {
            Some(slot) => {
                slot.pending = None;
                slot.queued.take()
            }
            None => return,
        };

        let _ = self.apply(device_id, target);

        if let Some((next, requested_at)) = queued {
            if requested_at.elapsed() <= self.inner.config.freshness {
                let _ = self.apply(device_id, next);
            } else {
                tracing::debug!("Dropped stale queued transition {} for {}", next, device_id);
            }
        }
    }

    fn apply(&self, device_id: &str, target: ConnectionState) -> Result<(), SensorError> {
        let now = self.inner.clock.now_ms();
        let (from, remember) = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(device_id)
                .ok_or_else(|| SensorError::SensorNotFound(device_id.to_string()))?;

            let from = slot.record.state;
            if !from.can_transition_to(target) {
                tracing::warn!(
                    "Rejected transition {} -> {} for {}",
                    from,
                    target,
                    device_id
                );
                return Err(SensorError::InvalidTransition { from, to: target });
            }

            slot.record.state = target;
            let remember = if target == ConnectionState::Connected {
                slot.connected_at = Some(now);
                Some(KnownDevice::new(
                    device_id,
                    slot.record.name.clone(),
                    slot.record.sensor_type,
                ))
            } else {
                slot.connected_at = None;
                None
            };
            (from, remember)
        };

        tracing::debug!("{}: {} -> {}", device_id, from, target);

        if let Some(device) = remember {
            tracing::info!("Connected to {} ({})", device.name, device_id);
            if let Err(e) = self.inner.known.remember(&device) {
                tracing::warn!("Failed to remember {}: {}", device_id, e);
            }
        }

        self.inner.events.publish(SensorEvent::ConnectionChanged {
            device_id: device_id.to_string(),
            state: target,
        });

        if from == ConnectionState::Connected
            && target == ConnectionState::Disconnected
            && self.inner.config.auto_reconnect
        {
            self.schedule_reconnect(device_id);
        }

        Ok(())
    }

    /// Note that data arrived from a device.
    ///
    /// A disconnected device is revived to `Connected` at once and any
    /// in-flight reconnection is cancelled. A `Failed` device stays failed.
    pub fn record_data(&self, device_id: &str) {
        let now = self.inner.clock.now_ms();
        let state = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(device_id) else {
                return;
            };
            slot.record.last_data_at = Some(now);
            if slot.record.state != ConnectionState::Failed && slot.cancel_reconnect() {
                tracing::debug!("Data from {} cancelled reconnection", device_id);
            }
            slot.record.state
        };

        match state {
            ConnectionState::Disconnected => {
                tracing::info!("{} is sending data again", device_id);
                let _ = self
                    .transition_now(device_id, ConnectionState::Connecting)
                    .and_then(|_| self.transition_now(device_id, ConnectionState::Connected));
            }
            ConnectionState::Connecting => {
                let _ = self.transition_now(device_id, ConnectionState::Connected);
            }
            ConnectionState::Connected | ConnectionState::Failed => {}
        }
    }

    /// The physical link dropped. Debounced so a flapping link settles.
    pub fn report_link_loss(&self, device_id: &str) {
        tracing::warn!("Link lost to {}", device_id);
        self.request_transition(device_id, ConnectionState::Disconnected);
    }

    /// Disconnect connected devices that have gone silent longer than the
    /// data timeout. Returns the ids that were disconnected.
    pub fn check_health(&self) -> Vec<String> {
        let now = self.inner.clock.now_ms();
        let timeout_ms = self.inner.config.data_timeout.as_millis() as Timestamp;

        let stale: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.record.state == ConnectionState::Connected)
            .filter(|(_, slot)| {
                let last = slot.record.last_data_at.max(slot.connected_at).unwrap_or(0);
                now.saturating_sub(last) > timeout_ms
            })
            .map(|(id, _)| id.clone())
            .collect();

        for device_id in &stale {
            tracing::warn!(
                "No data from {} for {:?}, marking disconnected",
                device_id,
                self.inner.config.data_timeout
            );
            let _ = self.transition_now(device_id, ConnectionState::Disconnected);
        }
        stale
    }

    /// Start the periodic health check, replacing any running one.
    pub fn start_health_monitor(&self) {
        let weak: Weak<LinkInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        LinkSupervisor { inner }.check_health();
                    }
                    None => break,
                }
            }
        });

        let mut health = self.inner.health.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = health.replace(handle) {
            previous.abort();
        }
    }

    /// Schedule reconnection with exponential backoff. A device with a
    /// running reconnection is left alone.
    pub fn schedule_reconnect(&self, device_id: &str) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(device_id) else {
            return;
        };

        if slot.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Reconnection already running for {}", device_id);
            return;
        }

        let link = self.clone();
        let id = device_id.to_string();
        slot.reconnect = Some(tokio::spawn(async move {
            link.reconnect_loop(&id).await;
        }));
    }

    async fn reconnect_loop(&self, device_id: &str) {
        let config = &self.inner.config;

        for attempt in 1..=config.max_reconnect_attempts {
            let delay = config.backoff_delay(attempt);
            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                device_id,
                delay,
                attempt,
                config.max_reconnect_attempts
            );
            self.inner.events.publish(SensorEvent::ReconnectScheduled {
                device_id: device_id.to_string(),
                attempt,
                delay,
            });

            tokio::time::sleep(delay).await;

            if self.apply(device_id, ConnectionState::Connecting).is_err() {
                return;
            }

            let outcome = tokio::time::timeout(
                config.connection_timeout,
                self.inner.connector.connect(device_id),
            )
            .await;

            match outcome {
                Ok(Ok(())) => {
                    let _ = self.apply(device_id, ConnectionState::Connected);
                    return;
                }
                Ok(Err(e)) => tracing::warn!("Reconnect to {} failed: {}", device_id, e),
                Err(_) => tracing::warn!("Reconnect to {} timed out", device_id),
            }

            if self.apply(device_id, ConnectionState::Disconnected).is_err() {
                return;
            }
        }

        tracing::warn!(
            "Giving up on {} after {} attempts",
            device_id,
            config.max_reconnect_attempts
        );
        let _ = self.apply(device_id, ConnectionState::Failed);
    }

    /// Connect a device on the caller's request.
    ///
    /// Transitions are immediate. A failed attempt leaves the device `Failed`.
    pub async fn connect(&self, device_id: &str, name: &str) -> Result<(), SensorError> {
        self.add_device(DeviceRecord::new(device_id, name));

        let state = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(device_id)
                .ok_or_else(|| SensorError::SensorNotFound(device_id.to_string()))?;
            slot.cancel_reconnect();
            slot.record.state
        };

        match state {
            ConnectionState::Connected => return Ok(()),
            // An aborted reconnect attempt leaves the device mid-connect.
            ConnectionState::Connecting => {
                if let Some(slot) = self.slots().get_mut(device_id) {
                    slot.cancel_debounce();
                }
            }
            _ => self.transition_now(device_id, ConnectionState::Connecting)?,
        }

        let outcome = tokio::time::timeout(
            self.inner.config.connection_timeout,
            self.inner.connector.connect(device_id),
        )
        .await;

        let error = match outcome {
            Ok(Ok(())) => return self.transition_now(device_id, ConnectionState::Connected),
            Ok(Err(e)) => e,
            Err(_) => SensorError::ConnectionTimeout,
        };

        tracing::warn!("Connect to {} failed: {}", device_id, error);
        let _ = self.transition_now(device_id, ConnectionState::Failed);
        Err(error)
    }

    /// Disconnect on the caller's request: cancel timers, drop the link,
    /// remove the record and forget the device.
    pub async fn disconnect(&self, device_id: &str) -> Result<(), SensorError> {
        let mut slot = self
            .slots()
            .remove(device_id)
            .ok_or_else(|| SensorError::SensorNotFound(device_id.to_string()))?;
        slot.cancel_debounce();
        slot.cancel_reconnect();

        if let Err(e) = self.inner.connector.disconnect(device_id).await {
            tracing::warn!("Error disconnecting {}: {}", device_id, e);
        }
        if let Err(e) = self.inner.known.forget(device_id) {
            tracing::warn!("Failed to forget {}: {}", device_id, e);
        }

        tracing::info!("Disconnected from {}", device_id);
        self.inner.events.publish(SensorEvent::ConnectionChanged {
            device_id: device_id.to_string(),
            state: ConnectionState::Disconnected,
        });
        Ok(())
    }

    /// Track every known device and schedule reconnection for each.
    /// Returns how many were restored.
    pub fn restore_known(&self) -> Result<usize, StorageError> {
        let known = self.inner.known.list()?;
        let mut restored = 0;

        for device in known {
            if self.slots().contains_key(&device.device_id) {
                continue;
            }
            let mut record = DeviceRecord::new(&device.device_id, &device.name);
            record.sensor_type = device.sensor_type;
            self.add_device(record);
            self.schedule_reconnect(&device.device_id);
            restored += 1;
        }

        if restored > 0 {
            tracing::info!("Restoring {} known devices", restored);
        }
        Ok(restored)
    }

    /// Cancel every timer owned by the supervisor.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .inner
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        for slot in self.slots().values_mut() {
            slot.cancel_debounce();
            slot.cancel_reconnect();
        }
    }
}
