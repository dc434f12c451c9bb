//! Control engines for connected trainers.
//!
//! [`TrainerControls`] follows connection events. Whenever a device reaches
//! `Connected`, by a manual connect, a restore or a backoff reconnect, its
//! characteristics are refreshed and a trainer gets a fresh
//! [`FtmsController`]. A controller is dropped when its device loses the link.

use crate::events::Subscription;
use crate::sensors::control::FtmsController;
use crate::sensors::ftms::FTMS_CONTROL_POINT_UUID;
use crate::sensors::link::LinkSupervisor;
use crate::sensors::transport::ControlTransport;
use crate::sensors::types::{ConnectionState, ControlConfig, SensorEvent, SensorType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How often the watcher drains connection events.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// GATT details of connected devices.
pub trait GattSource: Send + Sync {
    /// Subscribed characteristics of a connected device.
    fn characteristics(&self, device_id: &str) -> Vec<Uuid>;

    /// Control transport for a connected device.
    fn transport_for(&self, device_id: &str) -> Option<Arc<dyn ControlTransport>>;
}

/// Registry of trainer control engines.
pub struct TrainerControls {
    link: LinkSupervisor,
    source: Arc<dyn GattSource>,
    config: ControlConfig,
    controllers: Mutex<HashMap<String, Arc<FtmsController>>>,
}

impl TrainerControls {
    pub fn new(link: LinkSupervisor, source: Arc<dyn GattSource>, config: ControlConfig) -> Self {
        Self {
            link,
            source,
            config,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    fn controllers(&self) -> MutexGuard<'_, HashMap<String, Arc<FtmsController>>> {
        self.controllers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Control engine of a connected trainer.
    pub fn controller(&self, device_id: &str) -> Option<Arc<FtmsController>> {
        self.controllers().get(device_id).cloned()
    }

    /// Refresh a freshly connected device and bring up its control engine
    /// if it is a trainer without one. Returns the new controller.
    pub async fn on_connected(&self, device_id: &str) -> Option<Arc<FtmsController>> {
        let characteristics = self.source.characteristics(device_id);
        let is_trainer = characteristics.contains(&FTMS_CONTROL_POINT_UUID)
            || self
                .link
                .record(device_id)
                .and_then(|r| r.sensor_type)
                .is_some_and(|t| t == SensorType::Trainer);
        self.link.set_sensor_info(
            device_id,
            is_trainer.then_some(SensorType::Trainer),
            characteristics,
        );
        if !is_trainer {
            return None;
        }

        let controller = {
            let mut controllers = self.controllers();
            if controllers.contains_key(device_id) {
                return None;
            }
            let transport = self.source.transport_for(device_id)?;
            let controller = Arc::new(FtmsController::new(
                device_id,
                transport,
                self.config.clone(),
            ));
            controllers.insert(device_id.to_string(), controller.clone());
            controller
        };

        match controller.discover_features().await {
            Ok(features) => self.link.set_control_features(device_id, features),
            Err(e) => tracing::warn!("Feature discovery failed for {}: {}", device_id, e),
        }
        if let Err(e) = controller.request_control().await {
            tracing::warn!("Could not take control of {}: {}", device_id, e);
        }

        tracing::info!("Control engine ready for {}", device_id);
        Some(controller)
    }

    /// Drop a device's control engine.
    pub fn remove(&self, device_id: &str) -> Option<Arc<FtmsController>> {
        self.controllers().remove(device_id)
    }

    pub fn clear(&self) {
        self.controllers().clear();
    }

    async fn handle(&self, event: SensorEvent) {
        let SensorEvent::ConnectionChanged { device_id, state } = event else {
            return;
        };
        match state {
            ConnectionState::Connected => {
                self.on_connected(&device_id).await;
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if self.remove(&device_id).is_some() {
                    tracing::debug!("Dropped control engine for {}", device_id);
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Follow connection events until the task is aborted.
    pub fn watch(self: &Arc<Self>, events: Subscription<SensorEvent>) -> JoinHandle<()> {
        let controls = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            loop {
                interval.tick().await;
                for event in events.drain() {
                    controls.handle(event).await;
                }
            }
        })
    }
}
