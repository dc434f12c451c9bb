//! Session recorder: owns the reading buffer and turns raw samples into
//! live session statistics.
//!
//! [`SessionCore`] holds all session state and is driven with explicit
//! timestamps. [`SessionRecorder`] wraps it with the two tokio timers (fast
//! tick and persistence tick) and the async sink flush.

use crate::clock::{MonotonicClock, Timestamp};
use crate::events::{EventBus, Subscription};
use crate::metrics::calculator::{estimate_load, MetricsCalculator, NP_WINDOW_SECS};
use crate::metrics::calories::{self, CalorieInputs};
use crate::metrics::geo;
use crate::metrics::physics::PhysicsModel;
use crate::metrics::validation;
use crate::metrics::zones::{HRZones, PowerZones, ZoneTimer, HR_ZONE_NAMES, POWER_ZONE_NAMES};
use crate::recording::buffer::ReadingBuffer;
use crate::recording::profile::{ProfileSource, UserProfile};
use crate::recording::sink::PersistenceSink;
use crate::recording::types::{
    MetricKind, RecorderConfig, RecorderError, RecordingStatus, Sample, SessionEvent,
    SessionStats, SpeedSource,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Power samples further apart than this are treated as a dropout.
const MAX_POWER_GAP_MS: u64 = 10_000;

/// Window for "current" readings and GPS speed.
const INSTANT_WINDOW_SECS: f64 = 3.0;

/// Distance is not integrated across tick gaps longer than this.
const MAX_DISTANCE_TICK_MS: u64 = 10_000;

/// Session state, driven by explicit timestamps.
pub struct SessionCore {
    config: RecorderConfig,
    buffer: Arc<ReadingBuffer>,
    sink: Arc<dyn PersistenceSink>,
    events: Arc<EventBus<SessionEvent>>,

    status: RecordingStatus,
    profile: UserProfile,
    physics: PhysicsModel,
    power_zones: Option<PowerZones>,
    hr_zones: Option<HRZones>,
    power_timer: ZoneTimer,
    hr_timer: ZoneTimer,
    calculator: MetricsCalculator,

    started_at: Timestamp,
    last_tick: Timestamp,
    pause_started: Option<Timestamp>,
    paused_ms: u64,
    distance_m: f64,
    /// Previous power sample for virtual distance
    last_power: Option<(Timestamp, f64)>,

    pending_readings: Vec<Sample>,
    last_reading_emit: Option<Timestamp>,

    stats: SessionStats,
}

impl SessionCore {
    pub fn new(
        config: RecorderConfig,
        buffer: Arc<ReadingBuffer>,
        sink: Arc<dyn PersistenceSink>,
        events: Arc<EventBus<SessionEvent>>,
    ) -> Self {
        Self {
            config,
            buffer,
            sink,
            events,
            status: RecordingStatus::Idle,
            profile: UserProfile::default(),
            physics: PhysicsModel::default(),
            power_zones: None,
            hr_zones: None,
            power_timer: ZoneTimer::new(POWER_ZONE_NAMES.len()),
            hr_timer: ZoneTimer::new(HR_ZONE_NAMES.len()),
            calculator: MetricsCalculator::new(),
            started_at: 0,
            last_tick: 0,
            pause_started: None,
            paused_ms: 0,
            distance_m: 0.0,
            last_power: None,
            pending_readings: Vec::new(),
            last_reading_emit: None,
            stats: SessionStats::default(),
        }
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    /// Latest statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    /// Begin a session with a fresh aggregate.
    pub fn start(&mut self, profile: UserProfile, now: Timestamp) -> Result<(), RecorderError> {
        match self.status {
            RecordingStatus::Recording | RecordingStatus::Paused => {
                return Err(RecorderError::AlreadyRecording)
            }
            RecordingStatus::Idle | RecordingStatus::Finished => {}
        }

        self.physics = profile
            .weight_kg
            .map(PhysicsModel::new)
            .unwrap_or_default();
        self.power_zones = profile.ftp_watts.filter(|f| *f > 0).map(PowerZones::from_ftp);
        self.hr_zones = profile.threshold_hr.filter(|t| *t > 0).map(HRZones::from_threshold);
        self.profile = profile;

        self.power_timer = ZoneTimer::new(POWER_ZONE_NAMES.len());
        self.hr_timer = ZoneTimer::new(HR_ZONE_NAMES.len());
        self.calculator.reset();
        self.started_at = now;
        self.last_tick = now;
        self.pause_started = None;
        self.paused_ms = 0;
        self.distance_m = 0.0;
        self.last_power = None;
        self.pending_readings.clear();
        self.last_reading_emit = None;

        self.stats = SessionStats {
            status: RecordingStatus::Recording,
            hr_zone_ms: vec![0; HR_ZONE_NAMES.len()],
            power_zone_ms: vec![0; POWER_ZONE_NAMES.len()],
            ..Default::default()
        };
        self.set_status(RecordingStatus::Recording);

        tracing::info!(
            "Session started ({:?}, ftp={:?}, threshold_hr={:?})",
            self.profile.environment,
            self.profile.ftp_watts,
            self.profile.threshold_hr
        );
        Ok(())
    }

    /// Accept a sensor sample.
    ///
    /// Out-of-range samples are dropped. While paused, samples reach the
    /// buffer and the live reading events but not the session aggregate.
    pub fn ingest(&mut self, sample: Sample, now: Timestamp) {
        if !matches!(self.status, RecordingStatus::Recording | RecordingStatus::Paused) {
            return;
        }

        if !validation::is_valid(&sample) {
            tracing::trace!("Dropping out-of-range {} sample", sample.metric);
            return;
        }

        self.buffer.add(sample);
        let recording = self.status == RecordingStatus::Recording;

        if let Some(point) = sample.as_position() {
            self.stats.last_position = Some(point);
            if recording {
                self.sink.add_position(&sample);
            }
            self.events.publish(SessionEvent::Position(sample));
            return;
        }

        if recording {
            self.calculator.record(&sample);
            self.sink.add(&sample);

            if sample.metric == MetricKind::Power && self.profile.is_indoor() {
                if let Some(power) = sample.as_scalar() {
                    self.add_virtual_distance(sample.timestamp, power);
                }
            }
        }

        self.pending_readings.push(sample);
        self.emit_readings(now);
    }

    fn add_virtual_distance(&mut self, timestamp: Timestamp, power: f64) {
        if let Some((prev_ts, prev_power)) = self.last_power {
            let gap = timestamp.saturating_sub(prev_ts);
            if gap <= MAX_POWER_GAP_MS {
                let velocity = self.physics.solve_velocity((prev_power + power) / 2.0);
                self.distance_m += velocity * gap as f64 / 1000.0;
            } else {
                tracing::debug!("Power gap of {}ms, not advancing virtual distance", gap);
            }
        }
        self.last_power = Some((timestamp, power));
    }

    /// Publish queued readings if the throttle interval has passed.
    fn emit_readings(&mut self, now: Timestamp) {
        if self.pending_readings.is_empty() {
            return;
        }

        let interval = self.config.reading_event_interval.as_millis() as Timestamp;
        let due = self
            .last_reading_emit
            .map_or(true, |last| now.saturating_sub(last) >= interval);

        if due {
            let batch = std::mem::take(&mut self.pending_readings);
            self.events.publish(SessionEvent::Readings(batch));
            self.last_reading_emit = Some(now);
        }
    }

    /// Fast tick: timing, distance, speed and zones, then the statistics
    /// pass. Emits and returns the new snapshot. No-op unless recording.
    pub fn fast_tick(&mut self, now: Timestamp) -> Option<SessionStats> {
        if self.status != RecordingStatus::Recording {
            return None;
        }

        self.update_timing(now);
        self.update_statistics(now);
        self.emit_readings(now);

        self.events.publish(SessionEvent::Stats(self.stats.clone()));
        Some(self.stats.clone())
    }

    /// Cheap pass: elapsed/moving time, speed, distance, zone time.
    fn update_timing(&mut self, now: Timestamp) {
        let delta = now.saturating_sub(self.last_tick);
        self.last_tick = now;

        let elapsed = now.saturating_sub(self.started_at);
        self.stats.elapsed_ms = elapsed;
        self.stats.paused_ms = self.paused_ms;
        self.stats.moving_ms = elapsed.saturating_sub(self.paused_ms);

        let speed = self.current_speed(now);
        self.stats.speed_kmh = speed.map(|(kmh, _)| kmh);
        self.stats.speed_source = speed.map(|(_, source)| source);
        if let Some((kmh, _)) = speed {
            self.stats.max_speed_kmh = Some(self.stats.max_speed_kmh.map_or(kmh, |m| m.max(kmh)));

            if !self.profile.is_indoor() && delta <= MAX_DISTANCE_TICK_MS {
                self.distance_m += kmh / 3.6 * delta as f64 / 1000.0;
            }
        }
        self.stats.distance_m = self.distance_m;

        let power = self.instant_value(MetricKind::Power, now);
        let hr = self.instant_value(MetricKind::HeartRate, now);

        let power_zone = self
            .power_zones
            .as_ref()
            .zip(power)
            .map(|(zones, p)| zones.get_zone(p));
        let hr_zone = self.hr_zones.as_ref().zip(hr).map(|(zones, h)| zones.get_zone(h));

        self.power_timer.advance(delta, power_zone);
        self.hr_timer.advance(delta, hr_zone);
        self.stats.power_zone = power_zone;
        self.stats.hr_zone = hr_zone;
        self.stats.power_zone_ms = self.power_timer.buckets().to_vec();
        self.stats.hr_zone_ms = self.hr_timer.buckets().to_vec();
    }

    /// Statistics pass: averages, maxima, calories and load estimates.
    fn update_statistics(&mut self, now: Timestamp) {
        let calc = &self.calculator;
        self.stats.avg_power = calc.average(MetricKind::Power);
        self.stats.max_power = calc.maximum(MetricKind::Power);
        self.stats.avg_hr = calc.average(MetricKind::HeartRate);
        self.stats.max_hr = calc.maximum(MetricKind::HeartRate);
        self.stats.avg_cadence = calc.average(MetricKind::Cadence);
        self.stats.max_cadence = calc.maximum(MetricKind::Cadence);
        self.stats.avg_temperature = calc.average(MetricKind::Temperature);
        self.stats.max_temperature = calc.maximum(MetricKind::Temperature);

        if let Some(sensor_max) = calc.maximum(MetricKind::Speed) {
            self.stats.max_speed_kmh =
                Some(self.stats.max_speed_kmh.map_or(sensor_max, |m| m.max(sensor_max)));
        }

        let moving_secs = self.stats.moving_ms as f64 / 1000.0;

        let estimate = calories::estimate(&CalorieInputs {
            avg_power: self.stats.avg_power,
            avg_hr: self.stats.avg_hr,
            threshold_hr: self.profile.threshold_hr.map(f64::from),
            weight_kg: self.profile.weight_kg,
            age: self.profile.age,
            category: self.profile.category,
            distance_m: self.distance_m,
            moving_secs,
        });
        self.stats.calories = estimate.kcal;
        self.stats.calorie_method = Some(estimate.method);

        let recent_power = self.buffer.recent_at(MetricKind::Power, NP_WINDOW_SECS, now);
        let load = estimate_load(
            &recent_power,
            self.profile.ftp_watts.map(f64::from),
            self.stats.avg_power,
            self.stats.avg_hr,
            moving_secs,
        );
        self.stats.normalized_power = load.normalized_power;
        self.stats.intensity_factor = load.intensity_factor;
        self.stats.tss = load.tss;
        self.stats.variability_index = load.variability_index;
        self.stats.efficiency_factor = load.efficiency_factor;
    }

    /// Most recent value of `metric` inside the instant window.
    fn instant_value(&self, metric: MetricKind, now: Timestamp) -> Option<f64> {
        self.buffer
            .recent_samples_at(metric, INSTANT_WINDOW_SECS, now)
            .last()
            .and_then(Sample::as_scalar)
    }

    /// Current speed in km/h and where it came from.
    ///
    /// Sensor speed wins, then GPS, then the power model when indoors.
    fn current_speed(&self, now: Timestamp) -> Option<(f64, SpeedSource)> {
        if let Some(kmh) = self.instant_value(MetricKind::Speed, now) {
            return Some((kmh, SpeedSource::Sensor));
        }

        let track = self.buffer.recent_positions_at(INSTANT_WINDOW_SECS, now);
        if let Some(ms) = geo::gps_speed_ms(&track) {
            return Some((ms * 3.6, SpeedSource::Gps));
        }

        if self.profile.is_indoor() {
            if let Some(power) = self.instant_value(MetricKind::Power, now) {
                let ms = self.physics.solve_velocity(power);
                return Some((ms * 3.6, SpeedSource::Virtual));
            }
        }

        None
    }

    /// Freeze timing at `now` and stop computing.
    pub fn pause(&mut self, now: Timestamp) -> Result<(), RecorderError> {
        if self.status != RecordingStatus::Recording {
            return Err(RecorderError::NotRecording);
        }

        self.update_timing(now);
        self.power_timer.interrupt();
        self.hr_timer.interrupt();
        self.last_power = None;
        self.pause_started = Some(now);
        self.set_status(RecordingStatus::Paused);

        tracing::info!("Session paused at {}ms moving", self.stats.moving_ms);
        Ok(())
    }

    /// Account for the pause and continue.
    pub fn resume(&mut self, now: Timestamp) -> Result<(), RecorderError> {
        if self.status != RecordingStatus::Paused {
            return Err(RecorderError::NotPaused);
        }

        if let Some(started) = self.pause_started.take() {
            self.paused_ms += now.saturating_sub(started);
        }
        self.last_tick = now;
        self.stats.paused_ms = self.paused_ms;
        self.set_status(RecordingStatus::Recording);

        tracing::info!("Session resumed ({}ms paused in total)", self.paused_ms);
        Ok(())
    }

    /// Final computation pass. Returns the frozen aggregate.
    pub fn finish(&mut self, now: Timestamp) -> Result<SessionStats, RecorderError> {
        match self.status {
            RecordingStatus::Idle => return Err(RecorderError::NotRecording),
            RecordingStatus::Finished => return Err(RecorderError::AlreadyFinished),
            RecordingStatus::Recording => self.update_timing(now),
            // Timing was frozen at pause; fold the open pause into the totals
            RecordingStatus::Paused => {
                if let Some(started) = self.pause_started.take() {
                    self.paused_ms += now.saturating_sub(started);
                }
                self.stats.elapsed_ms = now.saturating_sub(self.started_at);
                self.stats.paused_ms = self.paused_ms;
            }
        }

        self.update_statistics(now);
        if !self.pending_readings.is_empty() {
            let batch = std::mem::take(&mut self.pending_readings);
            self.events.publish(SessionEvent::Readings(batch));
        }

        self.set_status(RecordingStatus::Finished);
        tracing::info!(
            "Session finished: {:.0}m, {}s moving, {:.0} kcal",
            self.stats.distance_m,
            self.stats.moving_ms / 1000,
            self.stats.calories
        );
        Ok(self.stats.clone())
    }

    fn set_status(&mut self, status: RecordingStatus) {
        self.status = status;
        self.stats.status = status;
        self.events.publish(SessionEvent::StatusChanged(status));
    }
}

/// Session recorder with background timers.
pub struct SessionRecorder {
    core: Arc<Mutex<SessionCore>>,
    buffer: Arc<ReadingBuffer>,
    sink: Arc<dyn PersistenceSink>,
    events: Arc<EventBus<SessionEvent>>,
    profile_source: Arc<dyn ProfileSource>,
    config: RecorderConfig,
    clock: MonotonicClock,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRecorder {
    /// Create a recorder.
    pub fn new(
        config: RecorderConfig,
        profile_source: Arc<dyn ProfileSource>,
        sink: Arc<dyn PersistenceSink>,
        clock: MonotonicClock,
    ) -> Self {
        let buffer = Arc::new(ReadingBuffer::new(config.retention, clock));
        let events = Arc::new(EventBus::new());
        let core = SessionCore::new(config.clone(), buffer.clone(), sink.clone(), events.clone());

        Self {
            core: Arc::new(Mutex::new(core)),
            buffer,
            sink,
            events,
            profile_source,
            config,
            clock,
            timers: Mutex::new(Vec::new()),
        }
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        lock_core(&self.core)
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    /// The reading buffer backing this recorder.
    pub fn buffer(&self) -> &Arc<ReadingBuffer> {
        &self.buffer
    }

    pub fn status(&self) -> RecordingStatus {
        self.core().status()
    }

    /// Latest statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        self.core().stats()
    }

    /// Start recording. The profile is read once here.
    pub fn start(&self) -> Result<(), RecorderError> {
        let profile = self.profile_source.profile();
        self.core().start(profile, self.clock.now_ms())?;
        self.spawn_timers();
        Ok(())
    }

    /// Feed a sensor sample.
    pub fn ingest(&self, sample: Sample) {
        self.core().ingest(sample, self.clock.now_ms());
    }

    /// Pause recording and cancel both timers.
    pub fn pause(&self) -> Result<(), RecorderError> {
        self.core().pause(self.clock.now_ms())?;
        self.cancel_timers();
        Ok(())
    }

    /// Resume recording with fresh timers.
    pub fn resume(&self) -> Result<(), RecorderError> {
        self.core().resume(self.clock.now_ms())?;
        self.spawn_timers();
        Ok(())
    }

    /// Stop timers, run a final pass, flush if the sink has pending data,
    /// and return the frozen aggregate.
    pub async fn finish(&self) -> Result<SessionStats, RecorderError> {
        let stats = self.core().finish(self.clock.now_ms())?;
        self.cancel_timers();

        if self.sink.has_pending_data() {
            flush_sink(self.sink.as_ref(), &self.events).await;
        }

        self.buffer.clear();
        Ok(stats)
    }

    /// Run one persistence pass now.
    pub async fn persist_now(&self) {
        persistence_pass(self.sink.as_ref(), &self.buffer, &self.events).await;
    }

    fn spawn_timers(&self) {
        self.cancel_timers();

        let fast = {
            let core = self.core.clone();
            let clock = self.clock;
            let period = self.config.fast_tick;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    let started = std::time::Instant::now();
                    lock_core(&core).fast_tick(clock.now_ms());
                    let spent = started.elapsed();
                    if spent > period / 20 {
                        tracing::warn!("Fast tick took {:?}", spent);
                    }
                }
            })
        };

        let persistence = {
            let sink = self.sink.clone();
            let buffer = self.buffer.clone();
            let events = self.events.clone();
            let period = self.config.persistence_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    persistence_pass(sink.as_ref(), &buffer, &events).await;
                }
            })
        };

        if let Ok(mut timers) = self.timers.lock() {
            timers.push(fast);
            timers.push(persistence);
        }
    }

    fn cancel_timers(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for handle in timers.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

fn lock_core(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(|e| e.into_inner())
}

async fn flush_sink(sink: &dyn PersistenceSink, events: &EventBus<SessionEvent>) {
    if let Err(e) = sink.flush().await {
        tracing::warn!("Persistence flush failed, keeping data buffered: {}", e);
        events.publish(SessionEvent::PersistenceError(e.to_string()));
    }
}

async fn persistence_pass(
    sink: &dyn PersistenceSink,
    buffer: &ReadingBuffer,
    events: &EventBus<SessionEvent>,
) {
    flush_sink(sink, events).await;
    buffer.cleanup();
}
