//! Sensor manager for BLE device discovery and connection.
//!
//! [`BleCentral`] is the btleplug side: scanning, connecting, subscribing and
//! pumping notifications into a channel. [`SensorManager`] wires it to the
//! [`LinkSupervisor`], routes decoded notifications, and hands connected
//! trainers to [`TrainerControls`].

use crate::clock::{MonotonicClock, Timestamp};
use crate::events::{EventBus, Subscription};
use crate::recording::types::Sample;
use crate::sensors::control::FtmsController;
use crate::sensors::trainers::{GattSource, TrainerControls};
use crate::sensors::ftms::{
    parse_indoor_bike_data, FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID,
};
use crate::sensors::gatt::{
    classify, parse_battery_level, parse_csc_measurement, parse_cycling_power_measurement,
    parse_heart_rate_measurement, CscMeasurement, CscTracker, BATTERY_LEVEL_UUID,
    CSC_MEASUREMENT_UUID, CYCLING_POWER_MEASUREMENT_UUID, DATA_CHARACTERISTICS,
    HEART_RATE_MEASUREMENT_UUID, SCAN_SERVICES,
};
use crate::sensors::link::{DeviceConnector, LinkSupervisor};
use crate::sensors::transport::{ControlTransport, PeripheralTransport};
use crate::sensors::types::{
    ConnectionState, ControlConfig, DeviceRecord, DiscoveredSensor, SensorConfig, SensorError,
    SensorEvent,
};
use crate::storage::known_devices::KnownDeviceStore;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Raw traffic from a connected peripheral.
#[derive(Debug, Clone)]
pub enum PumpMessage {
    /// A characteristic notified or indicated
    Notification {
        device_id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The notification stream ended
    LinkLost(String),
}

/// A notification after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Samples(Vec<Sample>),
    /// Needs the previous measurement to become samples
    Csc(CscMeasurement),
    Battery(u8),
    ControlIndication,
    Unknown,
}

/// Decode one notification by characteristic.
pub fn decode_notification(characteristic: Uuid, data: &[u8], timestamp: Timestamp) -> Decoded {
    if characteristic == INDOOR_BIKE_DATA_UUID {
        parse_indoor_bike_data(data)
            .map(|d| Decoded::Samples(d.samples(timestamp)))
            .unwrap_or(Decoded::Unknown)
    } else if characteristic == CYCLING_POWER_MEASUREMENT_UUID {
        parse_cycling_power_measurement(data)
            .map(|d| Decoded::Samples(d.samples(timestamp)))
            .unwrap_or(Decoded::Unknown)
    } else if characteristic == HEART_RATE_MEASUREMENT_UUID {
        match parse_heart_rate_measurement(data) {
            Some(hr) => {
                let rr = hr.rr_intervals_ms();
                if !rr.is_empty() {
                    tracing::trace!("RR intervals: {:?}", rr);
                }
                Decoded::Samples(hr.samples(timestamp))
            }
            None => Decoded::Unknown,
        }
    } else if characteristic == CSC_MEASUREMENT_UUID {
        parse_csc_measurement(data)
            .map(Decoded::Csc)
            .unwrap_or(Decoded::Unknown)
    } else if characteristic == BATTERY_LEVEL_UUID {
        parse_battery_level(data)
            .map(Decoded::Battery)
            .unwrap_or(Decoded::Unknown)
    } else if characteristic == FTMS_CONTROL_POINT_UUID {
        Decoded::ControlIndication
    } else {
        Decoded::Unknown
    }
}

/// Per-device control point indication channels.
#[derive(Debug, Default)]
pub struct ResponseRouter {
    senders: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl ResponseRouter {
    pub fn register(&self, device_id: &str, sender: broadcast::Sender<Vec<u8>>) {
        lock(&self.senders).insert(device_id.to_string(), sender);
    }

    pub fn remove(&self, device_id: &str) {
        lock(&self.senders).remove(device_id);
    }

    /// Forward an indication. Returns false when nobody is registered.
    pub fn forward(&self, device_id: &str, data: Vec<u8>) -> bool {
        match lock(&self.senders).get(device_id) {
            Some(sender) => {
                let _ = sender.send(data);
                true
            }
            None => false,
        }
    }
}

/// Routes pump traffic to the link supervisor and event bus.
#[derive(Clone)]
pub struct NotificationRouter {
    link: LinkSupervisor,
    events: Arc<EventBus<SensorEvent>>,
    responses: Arc<ResponseRouter>,
    csc: Arc<Mutex<HashMap<String, CscTracker>>>,
    clock: MonotonicClock,
}

impl NotificationRouter {
    pub fn new(
        link: LinkSupervisor,
        events: Arc<EventBus<SensorEvent>>,
        responses: Arc<ResponseRouter>,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            link,
            events,
            responses,
            csc: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn publish_samples(&self, device_id: &str, samples: Vec<Sample>) {
        for sample in samples {
            self.events.publish(SensorEvent::Reading {
                device_id: device_id.to_string(),
                sample,
            });
        }
    }

    pub fn handle(&self, message: PumpMessage) {
        match message {
            PumpMessage::Notification {
                device_id,
                characteristic,
                value,
            } => {
                let timestamp = self.clock.now_ms();
                match decode_notification(characteristic, &value, timestamp) {
                    Decoded::Samples(samples) => {
                        if samples.is_empty() {
                            return;
                        }
                        self.link.record_data(&device_id);
                        self.publish_samples(&device_id, samples);
                    }
                    Decoded::Csc(measurement) => {
                        let samples = lock(&self.csc)
                            .entry(device_id.clone())
                            .or_default()
                            .update(measurement, timestamp);
                        self.link.record_data(&device_id);
                        self.publish_samples(&device_id, samples);
                    }
                    Decoded::Battery(level) => self.link.update_battery(&device_id, level),
                    Decoded::ControlIndication => {
                        if !self.responses.forward(&device_id, value) {
                            tracing::debug!("Control indication from {} with no listener", device_id);
                        }
                    }
                    Decoded::Unknown => {
                        tracing::trace!("Ignored notification {} from {}", characteristic, device_id);
                    }
                }
            }
            PumpMessage::LinkLost(device_id) => {
                lock(&self.csc).remove(&device_id);
                self.link.report_link_loss(&device_id);
            }
        }
    }
}

/// btleplug central: owns the adapter and connected peripherals.
pub struct BleCentral {
    adapter: Adapter,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    pump_tx: mpsc::UnboundedSender<PumpMessage>,
    responses: Arc<ResponseRouter>,
}

impl BleCentral {
    pub fn new(
        adapter: Adapter,
        pump_tx: mpsc::UnboundedSender<PumpMessage>,
        responses: Arc<ResponseRouter>,
    ) -> Self {
        Self {
            adapter,
            peripherals: Mutex::new(HashMap::new()),
            pumps: Mutex::new(HashMap::new()),
            pump_tx,
            responses,
        }
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral, SensorError> {
        if let Some(peripheral) = lock(&self.peripherals).get(device_id) {
            return Ok(peripheral.clone());
        }

        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| SensorError::SensorNotFound(device_id.to_string()))
    }

    async fn subscribe_to_characteristics(
        &self,
        peripheral: &Peripheral,
    ) -> Result<(), SensorError> {
        for characteristic in peripheral.characteristics() {
            let uuid = characteristic.uuid;
            match subscription_for(uuid, characteristic.properties) {
                SubscribeMode::Required => {
                    peripheral
                        .subscribe(&characteristic)
                        .await
                        .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))?;
                }
                SubscribeMode::Optional => {
                    if let Err(e) = peripheral.subscribe(&characteristic).await {
                        tracing::warn!("Skipping optional characteristic {}: {}", uuid, e);
                        continue;
                    }
                }
                SubscribeMode::Skip => continue,
            }
            tracing::debug!("Subscribed to characteristic: {}", uuid);
        }
        Ok(())
    }

    fn spawn_pump(&self, device_id: &str, peripheral: Peripheral) {
        let tx = self.pump_tx.clone();
        let id = device_id.to_string();

        let handle = tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("Failed to get notification stream for {}: {}", id, e);
                    let _ = tx.send(PumpMessage::LinkLost(id));
                    return;
                }
            };

            while let Some(notification) = stream.next().await {
                let message = PumpMessage::Notification {
                    device_id: id.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if tx.send(message).is_err() {
                    return;
                }
            }

            let _ = tx.send(PumpMessage::LinkLost(id));
        });

        if let Some(previous) = lock(&self.pumps).insert(device_id.to_string(), handle) {
            previous.abort();
        }
    }
}

impl GattSource for BleCentral {
    fn characteristics(&self, device_id: &str) -> Vec<Uuid> {
        lock(&self.peripherals)
            .get(device_id)
            .map(|p| {
                p.characteristics()
                    .into_iter()
                    .map(|c| c.uuid)
                    .filter(|uuid| is_subscribed(*uuid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers the new transport for control point indications.
    fn transport_for(&self, device_id: &str) -> Option<Arc<dyn ControlTransport>> {
        let peripheral = lock(&self.peripherals).get(device_id)?.clone();
        let transport = PeripheralTransport::new(peripheral);
        self.responses.register(device_id, transport.response_sender());
        Some(Arc::new(transport))
    }
}

/// How connecting treats a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscribeMode {
    /// Connecting fails if subscribing fails
    Required,
    /// Subscribed when possible
    Optional,
    Skip,
}

/// Battery level notify is optional in the Battery Service.
fn subscription_for(uuid: Uuid, properties: CharPropFlags) -> SubscribeMode {
    if uuid == BATTERY_LEVEL_UUID {
        if properties.contains(CharPropFlags::NOTIFY) {
            SubscribeMode::Optional
        } else {
            SubscribeMode::Skip
        }
    } else if is_subscribed(uuid) {
        SubscribeMode::Required
    } else {
        SubscribeMode::Skip
    }
}

fn is_subscribed(uuid: Uuid) -> bool {
    DATA_CHARACTERISTICS.contains(&uuid)
        || uuid == FTMS_CONTROL_POINT_UUID
        || uuid == BATTERY_LEVEL_UUID
}

#[async_trait]
impl DeviceConnector for BleCentral {
    async fn connect(&self, device_id: &str) -> Result<(), SensorError> {
        tracing::info!("Connecting to sensor: {}", device_id);
        let peripheral = self.find_peripheral(device_id).await?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|e| SensorError::ConnectionFailed(e.to_string()))?;
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| SensorError::ConnectionFailed(e.to_string()))?;

        self.subscribe_to_characteristics(&peripheral).await?;

        lock(&self.peripherals).insert(device_id.to_string(), peripheral.clone());
        self.spawn_pump(device_id, peripheral);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), SensorError> {
        if let Some(pump) = lock(&self.pumps).remove(device_id) {
            pump.abort();
        }
        self.responses.remove(device_id);

        let peripheral = lock(&self.peripherals).remove(device_id);
        if let Some(peripheral) = peripheral {
            peripheral
                .disconnect()
                .await
                .map_err(|e| SensorError::BleError(e.to_string()))?;
        }
        Ok(())
    }
}

/// Manages BLE sensor discovery, connection, and data streaming.
pub struct SensorManager {
    config: SensorConfig,
    control_config: ControlConfig,
    clock: MonotonicClock,
    known: Arc<dyn KnownDeviceStore>,
    events: Arc<EventBus<SensorEvent>>,
    central: Option<Arc<BleCentral>>,
    link: Option<LinkSupervisor>,
    controls: Option<Arc<TrainerControls>>,
    pump: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    discovered: Arc<Mutex<HashMap<String, DiscoveredSensor>>>,
    is_scanning: Arc<AtomicBool>,
}

impl SensorManager {
    /// Create a new sensor manager.
    pub fn new(
        config: SensorConfig,
        control_config: ControlConfig,
        known: Arc<dyn KnownDeviceStore>,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            config,
            control_config,
            clock,
            known,
            events: Arc::new(EventBus::new()),
            central: None,
            link: None,
            controls: None,
            pump: None,
            watcher: None,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            is_scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to sensor events.
    pub fn subscribe(&self) -> Subscription<SensorEvent> {
        self.events.subscribe()
    }

    /// Initialize the BLE adapter and start link supervision.
    ///
    /// This must be called before any sensor operations.
    pub async fn initialize(&mut self) -> Result<(), SensorError> {
        tracing::info!("Initializing SensorManager");

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SensorError::AdapterNotFound)?;

        let (pump_tx, mut pump_rx) = mpsc::unbounded_channel();
        let responses = Arc::new(ResponseRouter::default());
        let central = Arc::new(BleCentral::new(adapter, pump_tx, responses.clone()));

        let link = LinkSupervisor::new(
            self.config.clone(),
            central.clone(),
            self.known.clone(),
            self.clock,
            self.events.clone(),
        );
        link.start_health_monitor();

        let controls = Arc::new(TrainerControls::new(
            link.clone(),
            central.clone(),
            self.control_config.clone(),
        ));
        self.watcher = Some(controls.watch(self.events.subscribe()));

        let router = NotificationRouter::new(link.clone(), self.events.clone(), responses, self.clock);
        self.pump = Some(tokio::spawn(async move {
            while let Some(message) = pump_rx.recv().await {
                router.handle(message);
            }
        }));

        tracing::info!("BLE adapter initialized");
        self.central = Some(central);
        self.link = Some(link);
        self.controls = Some(controls);
        Ok(())
    }

    fn central(&self) -> Result<&Arc<BleCentral>, SensorError> {
        self.central.as_ref().ok_or(SensorError::AdapterNotFound)
    }

    fn link(&self) -> Result<&LinkSupervisor, SensorError> {
        self.link.as_ref().ok_or(SensorError::AdapterNotFound)
    }

    fn controls(&self) -> Result<&Arc<TrainerControls>, SensorError> {
        self.controls.as_ref().ok_or(SensorError::AdapterNotFound)
    }

    /// Start scanning for sensors. The scan stops by itself after the
    /// discovery timeout.
    pub async fn start_discovery(&self) -> Result<(), SensorError> {
        let adapter = self.central()?.adapter.clone();

        if self.is_scanning.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Starting sensor discovery");
        lock(&self.discovered).clear();

        let filter = ScanFilter {
            services: SCAN_SERVICES.to_vec(),
        };
        if let Err(e) = adapter.start_scan(filter).await {
            self.is_scanning.store(false, Ordering::SeqCst);
            return Err(SensorError::ScanFailed(e.to_string()));
        }
        self.events.publish(SensorEvent::ScanStarted);

        let discovered = self.discovered.clone();
        let events = self.events.clone();
        let is_scanning = self.is_scanning.clone();
        let timeout = self.config.discovery_timeout;

        tokio::spawn(async move {
            let scan = process_discovery_events(
                adapter.clone(),
                discovered,
                events.clone(),
                is_scanning.clone(),
            );
            if tokio::time::timeout(timeout, scan).await.is_err() {
                tracing::debug!("Discovery timed out after {:?}", timeout);
            }
            if is_scanning.swap(false, Ordering::SeqCst) {
                let _ = adapter.stop_scan().await;
                events.publish(SensorEvent::ScanStopped);
            }
        });

        Ok(())
    }

    /// Stop scanning for sensors.
    pub async fn stop_discovery(&self) -> Result<(), SensorError> {
        let central = self.central()?;
        if !self.is_scanning.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Stopping sensor discovery");
        central
            .adapter
            .stop_scan()
            .await
            .map_err(|e| SensorError::ScanFailed(e.to_string()))?;
        self.events.publish(SensorEvent::ScanStopped);
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    /// Sensors seen during the last scan.
    pub fn discovered(&self) -> Vec<DiscoveredSensor> {
        lock(&self.discovered).values().cloned().collect()
    }

    /// Every tracked device record.
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.link.as_ref().map(|l| l.records()).unwrap_or_default()
    }

    /// Schedule reconnection to every remembered device. A scan runs so the
    /// adapter can see them. Trainers get a control engine once connected.
    pub async fn restore_known_devices(&self) -> Result<usize, SensorError> {
        let restored = self.link()?.restore_known()?;
        if restored > 0 {
            self.start_discovery().await?;
        }
        Ok(restored)
    }

    /// Connect a sensor and, for trainers, bring up its control engine.
    pub async fn connect(&self, device_id: &str) -> Result<(), SensorError> {
        let link = self.link()?;
        let controls = self.controls()?;

        let discovered = lock(&self.discovered).get(device_id).cloned();
        let name = discovered
            .as_ref()
            .map(|d| d.name.clone())
            .unwrap_or_else(|| device_id.to_string());

        link.add_device(DeviceRecord::new(device_id, &name));
        link.set_sensor_info(
            device_id,
            discovered.as_ref().map(|d| d.sensor_type),
            Vec::new(),
        );

        link.connect(device_id, &name).await?;
        controls.on_connected(device_id).await;
        Ok(())
    }

    /// Control engine of a connected trainer.
    pub fn controller(&self, device_id: &str) -> Option<Arc<FtmsController>> {
        self.controls.as_ref()?.controller(device_id)
    }

    /// Disconnect a sensor and forget it.
    pub async fn disconnect(&self, device_id: &str) -> Result<(), SensorError> {
        if let Some(controls) = &self.controls {
            controls.remove(device_id);
        }
        self.link()?.disconnect(device_id).await
    }

    /// Shutdown the sensor manager.
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down SensorManager");
        let _ = self.stop_discovery().await;

        if let Some(link) = &self.link {
            link.shutdown();
            let connected: Vec<String> = link
                .records()
                .into_iter()
                .filter(|r| r.state == ConnectionState::Connected)
                .map(|r| r.device_id)
                .collect();
            if let Some(central) = &self.central {
                for device_id in connected {
                    if let Err(e) = central.disconnect(&device_id).await {
                        tracing::warn!("Error disconnecting {}: {}", device_id, e);
                    }
                }
            }
        }

        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(controls) = &self.controls {
            controls.clear();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Process discovery events from the adapter until scanning stops.
async fn process_discovery_events(
    adapter: Adapter,
    discovered: Arc<Mutex<HashMap<String, DiscoveredSensor>>>,
    events: Arc<EventBus<SensorEvent>>,
    is_scanning: Arc<AtomicBool>,
) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("Failed to get adapter events: {}", e);
            return;
        }
    };

    while let Some(event) = stream.next().await {
        if !is_scanning.load(Ordering::SeqCst) {
            break;
        }

        let CentralEvent::DeviceDiscovered(id) = event else {
            continue;
        };
        let Ok(peripheral) = adapter.peripheral(&id).await else {
            continue;
        };
        if let Some(sensor) = classify_peripheral(&peripheral).await {
            let is_new = lock(&discovered)
                .insert(sensor.device_id.clone(), sensor.clone())
                .is_none();
            if is_new {
                tracing::debug!("Discovered {} ({})", sensor.name, sensor.sensor_type);
                events.publish(SensorEvent::Discovered(sensor));
            }
        }
    }
}

/// Classify a peripheral based on its advertised services.
async fn classify_peripheral(peripheral: &Peripheral) -> Option<DiscoveredSensor> {
    let properties = peripheral.properties().await.ok()??;
    let (sensor_type, protocol) = classify(&properties.services)?;

    Some(DiscoveredSensor {
        device_id: peripheral.id().to_string(),
        name: properties
            .local_name
            .unwrap_or_else(|| "Unknown Sensor".to_string()),
        sensor_type,
        protocol,
        signal_strength: properties.rssi,
    })
}
