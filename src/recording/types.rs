//! Recording types for live session capture.
//!
//! Defines the `Sample` that flows from sensor parsers into the reading buffer,
//! the session aggregate returned to callers, recorder configuration, events
//! and errors.

use crate::clock::Timestamp;
use crate::metrics::calories::CalorieMethod;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Kind of metric carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Power in watts
    Power,
    /// Heart rate in BPM
    HeartRate,
    /// Cadence in RPM
    Cadence,
    /// Speed in km/h as reported by a sensor
    Speed,
    /// Temperature in degrees Celsius
    Temperature,
    /// Geographic position (latitude, longitude) in degrees
    Position,
}

impl MetricKind {
    /// All metric kinds.
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Power,
        MetricKind::HeartRate,
        MetricKind::Cadence,
        MetricKind::Speed,
        MetricKind::Temperature,
        MetricKind::Position,
    ];

    /// Stable string key for this metric.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Power => "power",
            MetricKind::HeartRate => "heart_rate",
            MetricKind::Cadence => "cadence",
            MetricKind::Speed => "speed",
            MetricKind::Temperature => "temperature",
            MetricKind::Position => "position",
        }
    }

    /// Whether samples of this metric carry a 2-component value.
    pub fn is_positional(&self) -> bool {
        matches!(self, MetricKind::Position)
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Returned when parsing an unknown metric key.
#[derive(Debug, Error)]
#[error("Unknown metric: {0}")]
pub struct UnknownMetric(pub String);

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Value carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SampleValue {
    /// Single numeric value
    Scalar(f64),
    /// Two-component value (e.g. latitude, longitude)
    Pair(f64, f64),
}

/// A single sensor reading. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Which metric this reading belongs to
    pub metric: MetricKind,
    /// The reading itself
    pub value: SampleValue,
    /// Monotonic timestamp in milliseconds
    pub timestamp: Timestamp,
}

impl Sample {
    /// Create a numeric sample.
    pub fn scalar(metric: MetricKind, value: f64, timestamp: Timestamp) -> Self {
        debug_assert!(!metric.is_positional(), "{metric} is not a numeric metric");
        Self {
            metric,
            value: SampleValue::Scalar(value),
            timestamp,
        }
    }

    /// Create a position sample.
    pub fn position(point: GeoPoint, timestamp: Timestamp) -> Self {
        Self {
            metric: MetricKind::Position,
            value: SampleValue::Pair(point.lat, point.lon),
            timestamp,
        }
    }

    /// Numeric value, if this is a numeric sample.
    pub fn as_scalar(&self) -> Option<f64> {
        match self.value {
            SampleValue::Scalar(v) => Some(v),
            SampleValue::Pair(..) => None,
        }
    }

    /// Position value, if this is a position sample.
    pub fn as_position(&self) -> Option<GeoPoint> {
        match self.value {
            SampleValue::Pair(lat, lon) => Some(GeoPoint::new(lat, lon)),
            SampleValue::Scalar(_) => None,
        }
    }

    /// Copy of this sample with a different timestamp.
    pub fn at(self, timestamp: Timestamp) -> Self {
        Self { timestamp, ..self }
    }
}

/// Status of the session recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// Not recording
    #[default]
    Idle,
    /// Actively recording
    Recording,
    /// Recording paused
    Paused,
    /// Session finished, aggregate frozen
    Finished,
}

/// Where the current speed figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedSource {
    /// Speed reported by a sensor
    Sensor,
    /// Derived from recent GPS positions
    Gps,
    /// Derived from power via the physics model
    Virtual,
}

/// Aggregate state of a recording session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Recorder status at the time of the snapshot
    pub status: RecordingStatus,
    /// Wall time since start, including pauses
    pub elapsed_ms: u64,
    /// Active (non-paused) time
    pub moving_ms: u64,
    /// Total time spent paused
    pub paused_ms: u64,
    /// Total distance in meters
    pub distance_m: f64,
    /// Current speed in km/h
    pub speed_kmh: Option<f64>,
    /// Source of the current speed
    pub speed_source: Option<SpeedSource>,
    /// Maximum speed in km/h
    pub max_speed_kmh: Option<f64>,
    /// Average power for the session
    pub avg_power: Option<f64>,
    /// Maximum power
    pub max_power: Option<f64>,
    /// Average heart rate
    pub avg_hr: Option<f64>,
    /// Maximum heart rate
    pub max_hr: Option<f64>,
    /// Average cadence
    pub avg_cadence: Option<f64>,
    /// Maximum cadence
    pub max_cadence: Option<f64>,
    /// Average temperature
    pub avg_temperature: Option<f64>,
    /// Maximum temperature
    pub max_temperature: Option<f64>,
    /// Estimated calories
    pub calories: f64,
    /// Tier of the calorie waterfall that produced `calories`
    pub calorie_method: Option<CalorieMethod>,
    /// Normalized power estimate (30s mean × 1.05, not the 4th-power algorithm)
    pub normalized_power: Option<f64>,
    /// Intensity factor estimate
    pub intensity_factor: Option<f64>,
    /// Training stress score estimate
    pub tss: Option<f64>,
    /// Variability index estimate
    pub variability_index: Option<f64>,
    /// Efficiency factor estimate
    pub efficiency_factor: Option<f64>,
    /// Time in each heart-rate zone (ms), 5 buckets
    pub hr_zone_ms: Vec<u64>,
    /// Time in each power zone (ms), 7 buckets
    pub power_zone_ms: Vec<u64>,
    /// Current heart-rate zone index
    pub hr_zone: Option<usize>,
    /// Current power zone index
    pub power_zone: Option<usize>,
    /// Last known position
    pub last_position: Option<GeoPoint>,
}

/// Events published by the session recorder.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Periodic session statistics
    Stats(SessionStats),
    /// Coalesced numeric reading updates
    Readings(Vec<Sample>),
    /// Position update, published immediately
    Position(Sample),
    /// Recorder status changed
    StatusChanged(RecordingStatus),
    /// Persistence failed; recording continues
    PersistenceError(String),
}

/// Configuration for the session recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Fast tick period (timing, distance, zones, statistics)
    pub fast_tick: Duration,
    /// Persistence tick period (flush + buffer cleanup)
    pub persistence_interval: Duration,
    /// Reading buffer retention window
    pub retention: Duration,
    /// Minimum spacing between numeric reading events
    pub reading_event_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            fast_tick: Duration::from_secs(1),
            persistence_interval: Duration::from_secs(120),
            retention: Duration::from_secs(60),
            reading_event_interval: Duration::from_millis(100),
        }
    }
}

/// Errors from the session recorder.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Already recording
    #[error("Recording already in progress")]
    AlreadyRecording,

    /// Not currently recording
    #[error("Not currently recording")]
    NotRecording,

    /// Not currently paused
    #[error("Recording is not paused")]
    NotPaused,

    /// Session already finished
    #[error("Session already finished")]
    AlreadyFinished,
}

/// Errors from a persistence sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink could not write buffered data
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// The sink is closed
    #[error("Sink closed")]
    Closed,
}
