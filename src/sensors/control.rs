//! FTMS trainer control engine.
//!
//! Drives one device's control point: reads the feature characteristic and
//! supported ranges once, then issues single-flight commands that wait for an
//! opcode-matched acknowledgement, retrying with backoff on timeout or
//! transport failure.
//!
//! The single-flight guard is a one-permit semaphore. Each acquisition parks
//! its permit in a slot that is emptied either after the settle delay that
//! follows the exchange, or by a watchdog if the holder never finishes.

use crate::sensors::ftms::{
    build_request_control, build_reset, build_set_simulation, build_set_target_cadence,
    build_set_target_heart_rate, build_set_target_inclination, build_set_target_power,
    build_set_target_resistance, build_set_target_speed, build_start_training,
    build_stop_training, parse_control_response, parse_features, parse_supported_range,
    ControlMode, ControlResponse, FeatureSet, SimulationParams, SupportedRange,
    FTMS_CONTROL_POINT_UUID, FTMS_FEATURE_UUID,
};
use crate::sensors::transport::ControlTransport;
use crate::sensors::types::{ControlConfig, ControlError, ControlEvent, ControlKind, SensorError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

type PermitSlot = Arc<Mutex<Option<OwnedSemaphorePermit>>>;

fn take_permit(slot: &PermitSlot) -> Option<OwnedSemaphorePermit> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// One-at-a-time guard over the control point.
#[derive(Debug)]
struct CommandGate {
    semaphore: Arc<Semaphore>,
    settle: Duration,
    guard_timeout: Duration,
}

impl CommandGate {
    fn new(settle: Duration, guard_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            settle,
            guard_timeout,
        }
    }

    /// Take the guard, or `None` if someone holds it.
    fn try_acquire(&self) -> Option<GateHold> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        let slot: PermitSlot = Arc::new(Mutex::new(Some(permit)));

        let watchdog = {
            let slot = slot.clone();
            let timeout = self.guard_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if take_permit(&slot).is_some() {
                    tracing::warn!("Control guard released by watchdog after {:?}", timeout);
                }
            })
        };

        Some(GateHold {
            slot,
            settle: self.settle,
            watchdog,
        })
    }

    fn is_held(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

/// A held guard. Released after the settle delay, or by the watchdog.
struct GateHold {
    slot: PermitSlot,
    settle: Duration,
    watchdog: JoinHandle<()>,
}

impl GateHold {
    fn release(self) {
        self.watchdog.abort();
        let slot = self.slot;
        let settle = self.settle;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            drop(take_permit(&slot));
        });
    }
}

/// Control engine for one FTMS device.
pub struct FtmsController {
    device_id: String,
    transport: Arc<dyn ControlTransport>,
    config: ControlConfig,
    gate: CommandGate,
    features: RwLock<Option<FeatureSet>>,
    ranges: RwLock<HashMap<ControlMode, SupportedRange>>,
    current_mode: Mutex<Option<ControlMode>>,
    log: Mutex<Vec<ControlEvent>>,
}

impl FtmsController {
    pub fn new(
        device_id: impl Into<String>,
        transport: Arc<dyn ControlTransport>,
        config: ControlConfig,
    ) -> Self {
        let gate = CommandGate::new(config.settle, config.guard_ceiling());
        Self {
            device_id: device_id.into(),
            transport,
            config,
            gate,
            features: RwLock::new(None),
            ranges: RwLock::new(HashMap::new()),
            current_mode: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Read the feature characteristic and the ranges of supported targets.
    ///
    /// Features are read once; later calls return the cached set. A range
    /// that cannot be read is left unset and the default clamp applies.
    pub async fn discover_features(&self) -> Result<FeatureSet, ControlError> {
        if let Some(features) = self.features() {
            return Ok(features);
        }

        let data = self.transport.read(FTMS_FEATURE_UUID).await?;
        let features = parse_features(&data).ok_or_else(|| {
            SensorError::ReadFailed(format!("feature characteristic too short ({} bytes)", data.len()))
        })?;

        let mut ranges = HashMap::new();
        for mode in ControlMode::ALL {
            if !features.supports(mode) {
                continue;
            }
            let Some(uuid) = mode.range_characteristic() else {
                continue;
            };

            match self.transport.read(uuid).await {
                Ok(bytes) => match parse_supported_range(mode, &bytes) {
                    Some(range) => {
                        tracing::debug!("{} range {:?}", mode, range);
                        ranges.insert(mode, range);
                    }
                    None => tracing::warn!("Malformed {} range on {}", mode, self.device_id),
                },
                Err(e) => tracing::warn!("Could not read {} range on {}: {}", mode, self.device_id, e),
            }
        }

        if let Ok(mut slot) = self.ranges.write() {
            *slot = ranges;
        }
        if let Ok(mut slot) = self.features.write() {
            *slot = Some(features);
        }

        tracing::info!("Discovered control features on {}: {:?}", self.device_id, features.targets);
        Ok(features)
    }

    /// Features, once discovered.
    pub fn features(&self) -> Option<FeatureSet> {
        self.features.read().ok().and_then(|f| *f)
    }

    /// Advertised range for a mode, if the device reported one.
    pub fn range(&self, mode: ControlMode) -> Option<SupportedRange> {
        self.ranges.read().ok().and_then(|r| r.get(&mode).copied())
    }

    /// Clamp `value` to the advertised range, else the default range, and
    /// to what the command can encode.
    pub fn clamp(&self, mode: ControlMode, value: f64) -> f64 {
        let value = self
            .range(mode)
            .unwrap_or_else(|| mode.default_range())
            .clamp(value);
        match mode.wire_range() {
            Some(wire) => wire.clamp(value),
            None => value,
        }
    }

    /// Active control mode.
    pub fn current_mode(&self) -> Option<ControlMode> {
        *self.mode_slot()
    }

    /// Whether a command currently holds the guard.
    pub fn is_busy(&self) -> bool {
        self.gate.is_held()
    }

    /// Audit log of control exchanges, oldest first.
    pub fn control_log(&self) -> Vec<ControlEvent> {
        self.log_slot().clone()
    }

    /// Drop every audit entry.
    pub fn clear_control_log(&self) {
        self.log_slot().clear();
    }

    fn mode_slot(&self) -> MutexGuard<'_, Option<ControlMode>> {
        self.current_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_slot(&self) -> MutexGuard<'_, Vec<ControlEvent>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the machine for control.
    pub async fn request_control(&self) -> Result<ControlResponse, ControlError> {
        self.command(ControlKind::RequestControl, None, build_request_control())
            .await
    }

    /// Start or resume training.
    pub async fn start(&self) -> Result<ControlResponse, ControlError> {
        self.command(ControlKind::Start, None, build_start_training()).await
    }

    /// Stop or pause training.
    pub async fn stop(&self, pause: bool) -> Result<ControlResponse, ControlError> {
        self.command(ControlKind::Stop, None, build_stop_training(pause))
            .await
    }

    /// Reset the machine and clear the active mode.
    pub async fn reset(&self) -> Result<ControlResponse, ControlError> {
        let response = self.command(ControlKind::Reset, None, build_reset()).await?;
        *self.mode_slot() = None;
        Ok(response)
    }

    /// ERG mode: hold `watts`.
    pub async fn set_target_power(&self, watts: f64) -> Result<(), ControlError> {
        self.apply_target(ControlMode::Power, watts, build_set_target_power)
            .await
    }

    /// SIM mode. Grade is clamped; the other parameters are sent as given.
    pub async fn set_simulation(&self, params: SimulationParams) -> Result<(), ControlError> {
        self.apply_target(ControlMode::Simulation, params.grade_percent, |grade| {
            build_set_simulation(&SimulationParams {
                grade_percent: grade,
                ..params
            })
        })
        .await
    }

    /// Fixed resistance level.
    pub async fn set_resistance_target(&self, level: f64) -> Result<(), ControlError> {
        self.apply_target(ControlMode::Resistance, level, build_set_target_resistance)
            .await
    }

    /// Target speed in km/h.
    pub async fn set_speed_target(&self, kmh: f64) -> Result<(), ControlError> {
        self.apply_target(ControlMode::Speed, kmh, build_set_target_speed)
            .await
    }

    /// Target inclination in percent.
    pub async fn set_inclination_target(&self, percent: f64) -> Result<(), ControlError> {
        self.apply_target(ControlMode::Inclination, percent, build_set_target_inclination)
            .await
    }

    /// Target heart rate in bpm.
    pub async fn set_heart_rate_target(&self, bpm: f64) -> Result<(), ControlError> {
        self.apply_target(ControlMode::HeartRate, bpm, build_set_target_heart_rate)
            .await
    }

    /// Target cadence in rpm.
    pub async fn set_cadence_target(&self, rpm: f64) -> Result<(), ControlError> {
        self.apply_target(ControlMode::Cadence, rpm, build_set_target_cadence)
            .await
    }

    /// Switch to `mode` with `value`.
    ///
    /// Checks capability before anything touches the wire. When another mode
    /// is active, a reset goes out first under the same guard. The mode marker
    /// moves only once the whole sequence succeeds.
    async fn apply_target<F>(&self, mode: ControlMode, value: f64, encode: F) -> Result<(), ControlError>
    where
        F: Fn(f64) -> Vec<u8>,
    {
        let features = self.features().ok_or(ControlError::NotDiscovered)?;
        if !features.supports(mode) {
            tracing::warn!("Capability mismatch: {} does not support {} control", self.device_id, mode);
            return Err(ControlError::Unsupported(mode));
        }

        let hold = self.gate.try_acquire().ok_or(ControlError::Busy)?;
        let clamped = self.clamp(mode, value);
        if clamped != value {
            tracing::debug!("{} target {} clamped to {}", mode, value, clamped);
        }

        let result = self.switch_mode(mode, clamped, encode(clamped)).await;
        hold.release();
        result
    }

    async fn switch_mode(&self, mode: ControlMode, value: f64, command: Vec<u8>) -> Result<(), ControlError> {
        let current = self.current_mode();

        if current.is_some_and(|m| m != mode) {
            let reset = self.exchange(build_reset()).await;
            self.record(ControlKind::Reset, None, &reset);
            reset?;
        }

        let target = self.exchange(command).await;
        self.record(ControlKind::Target(mode), Some(value), &target);
        target?;

        if current != Some(mode) {
            tracing::info!("{} switched to {} mode", self.device_id, mode);
        }
        *self.mode_slot() = Some(mode);
        Ok(())
    }

    /// Single-flight exchange for commands that do not change mode.
    async fn command(
        &self,
        kind: ControlKind,
        value: Option<f64>,
        command: Vec<u8>,
    ) -> Result<ControlResponse, ControlError> {
        let hold = self.gate.try_acquire().ok_or(ControlError::Busy)?;
        let result = self.exchange(command).await;
        hold.release();
        self.record(kind, value, &result);
        result
    }

    /// Write `command` and wait for the matching acknowledgement, retrying
    /// on timeout or transport failure. A failure result from the device is
    /// final.
    async fn exchange(&self, command: Vec<u8>) -> Result<ControlResponse, ControlError> {
        let opcode = command.first().copied().unwrap_or_default();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.retry_delay(attempt);
                tracing::debug!("Retry {} for opcode 0x{:02X} in {:?}", attempt, opcode, delay);
                tokio::time::sleep(delay).await;
            }

            // Listen before writing so a fast indication is not missed
            let mut responses = self.transport.control_responses();

            if let Err(e) = self.transport.write(FTMS_CONTROL_POINT_UUID, &command).await {
                tracing::warn!("Control write 0x{:02X} failed: {}", opcode, e);
                continue;
            }
            tracing::debug!("Wrote control command {:02X?}", command);

            match tokio::time::timeout(self.config.ack_timeout, wait_for_ack(&mut responses, opcode)).await {
                Ok(Some(response)) if response.result.is_success() => return Ok(response),
                Ok(Some(response)) => {
                    tracing::warn!("Opcode 0x{:02X} rejected: {}", opcode, response.result);
                    return Err(ControlError::Rejected(response.result));
                }
                Ok(None) => tracing::warn!("Control response channel closed"),
                Err(_) => tracing::warn!(
                    "No acknowledgement for opcode 0x{:02X} within {:?}",
                    opcode,
                    self.config.ack_timeout
                ),
            }
        }

        Err(ControlError::RetriesExhausted)
    }

    fn record<T>(&self, kind: ControlKind, requested_value: Option<f64>, result: &Result<T, ControlError>) {
        self.log_slot().push(ControlEvent {
            timestamp: chrono::Utc::now(),
            kind,
            requested_value,
            success: result.is_ok(),
            reason: result.as_ref().err().map(|e| e.to_string()),
        });
    }
}

/// Wait for a response echoing `opcode`. Others are ignored.
async fn wait_for_ack(
    responses: &mut broadcast::Receiver<Vec<u8>>,
    opcode: u8,
) -> Option<ControlResponse> {
    loop {
        match responses.recv().await {
            Ok(bytes) => match parse_control_response(&bytes) {
                Some(response) if response.request_opcode == opcode => return Some(response),
                Some(response) => tracing::debug!(
                    "Ignoring response for opcode 0x{:02X} while waiting on 0x{:02X}",
                    response.request_opcode,
                    opcode
                ),
                None => tracing::debug!("Ignoring malformed control indication {:02X?}", bytes),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Control response listener lagged by {}", n)
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
