//! Standard GATT services and notification parsers for non-FTMS sensors.
//!
//! Covers Cycling Power (0x1818), Heart Rate (0x180D), Cycling Speed and
//! Cadence (0x1816) and Battery (0x180F).

use crate::clock::Timestamp;
use crate::recording::types::{MetricKind, Sample};
use crate::sensors::ftms::{FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID};
use crate::sensors::types::{Protocol, SensorType};
use uuid::Uuid;

/// Cycling Power Service UUID (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement UUID (0x2A63)
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement UUID (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Speed and Cadence Service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement UUID (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Wheel circumference assumed for CSC speed, in metres (700x25c).
pub const DEFAULT_WHEEL_CIRCUMFERENCE_M: f64 = 2.105;

/// Battery Service UUID (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// Battery Level UUID (0x2A19)
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

/// Services a scan filters on.
pub const SCAN_SERVICES: [Uuid; 4] = [
    FTMS_SERVICE_UUID,
    CYCLING_POWER_SERVICE_UUID,
    HEART_RATE_SERVICE_UUID,
    CSC_SERVICE_UUID,
];

/// Characteristics whose notifications carry readings.
pub const DATA_CHARACTERISTICS: [Uuid; 5] = [
    INDOOR_BIKE_DATA_UUID,
    CYCLING_POWER_MEASUREMENT_UUID,
    HEART_RATE_MEASUREMENT_UUID,
    CSC_MEASUREMENT_UUID,
    BATTERY_LEVEL_UUID,
];

/// Classify a peripheral from its advertised services.
///
/// FTMS wins over Cycling Power, which wins over Heart Rate.
pub fn classify(services: &[Uuid]) -> Option<(SensorType, Protocol)> {
    if services.contains(&FTMS_SERVICE_UUID) {
        Some((SensorType::Trainer, Protocol::BleFtms))
    } else if services.contains(&CYCLING_POWER_SERVICE_UUID) {
        Some((SensorType::PowerMeter, Protocol::BleCyclingPower))
    } else if services.contains(&HEART_RATE_SERVICE_UUID) {
        Some((SensorType::HeartRate, Protocol::BleHeartRate))
    } else if services.contains(&CSC_SERVICE_UUID) {
        Some((SensorType::SpeedCadence, Protocol::BleCsc))
    } else {
        None
    }
}

/// Little-endian field reader over a notification payload.
#[derive(Debug)]
pub(crate) struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.data.get(self.offset..self.offset + N)?;
        self.offset += N;
        bytes.try_into().ok()
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    pub(crate) fn i16(&mut self) -> Option<i16> {
        self.take::<2>().map(i16::from_le_bytes)
    }

    pub(crate) fn u24(&mut self) -> Option<u32> {
        self.take::<3>().map(|[a, b, c]| u32::from_le_bytes([a, b, c, 0]))
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Option<()> {
        if self.offset + n > self.data.len() {
            return None;
        }
        self.offset += n;
        Some(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }
}

/// Parsed Cycling Power Measurement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CyclingPowerData {
    /// Instantaneous power in watts
    pub power_watts: i16,
    /// Pedal power balance in 0.5% units (if present)
    pub power_balance: Option<u8>,
    /// Accumulated torque in 1/32 Nm (if present)
    pub accumulated_torque: Option<u16>,
    /// Cumulative wheel revolutions (if present)
    pub wheel_revolutions: Option<u32>,
    /// Cumulative crank revolutions (if present)
    pub crank_revolutions: Option<u16>,
    /// Last crank event time in 1/1024 s (if present)
    pub last_crank_event_time: Option<u16>,
}

impl CyclingPowerData {
    /// Samples carried by this measurement.
    pub fn samples(&self, timestamp: Timestamp) -> Vec<Sample> {
        vec![Sample::scalar(MetricKind::Power, self.power_watts as f64, timestamp)]
    }
}

/// Parse a Cycling Power Measurement notification.
///
/// Optional fields that are cut short are left unset; the power value is
/// always reported.
pub fn parse_cycling_power_measurement(data: &[u8]) -> Option<CyclingPowerData> {
    let mut reader = FieldReader::new(data);
    let flags = reader.u16()?;
    let mut result = CyclingPowerData {
        power_watts: reader.i16()?,
        ..Default::default()
    };

    // Pedal Power Balance (bit 0)
    if flags & 0x0001 != 0 {
        result.power_balance = reader.u8();
    }
    // Accumulated Torque (bit 2)
    if flags & 0x0004 != 0 {
        result.accumulated_torque = reader.u16();
    }
    // Wheel Revolution Data (bit 4): u32 revolutions + u16 event time
    if flags & 0x0010 != 0 {
        result.wheel_revolutions = reader.u32();
        reader.skip(2);
    }
    // Crank Revolution Data (bit 5)
    if flags & 0x0020 != 0 {
        result.crank_revolutions = reader.u16();
        result.last_crank_event_time = reader.u16();
    }

    Some(result)
}

/// Parsed Heart Rate Measurement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartRateData {
    /// Heart rate in BPM
    pub heart_rate_bpm: u16,
    /// RR intervals in 1/1024 s
    pub rr_intervals: Vec<u16>,
    /// Energy expended in kJ (if present)
    pub energy_expended: Option<u16>,
    /// Sensor contact detected
    pub sensor_contact: bool,
}

impl HeartRateData {
    /// Samples carried by this measurement.
    pub fn samples(&self, timestamp: Timestamp) -> Vec<Sample> {
        vec![Sample::scalar(MetricKind::HeartRate, self.heart_rate_bpm as f64, timestamp)]
    }

    /// RR intervals in milliseconds.
    pub fn rr_intervals_ms(&self) -> Vec<f64> {
        self.rr_intervals
            .iter()
            .map(|rr| *rr as f64 * 1000.0 / 1024.0)
            .collect()
    }
}

/// Parse a Heart Rate Measurement notification.
pub fn parse_heart_rate_measurement(data: &[u8]) -> Option<HeartRateData> {
    let mut reader = FieldReader::new(data);
    let flags = reader.u8()?;

    let heart_rate_bpm = if flags & 0x01 != 0 {
        reader.u16()?
    } else {
        reader.u8()? as u16
    };

    let mut result = HeartRateData {
        heart_rate_bpm,
        sensor_contact: flags & 0x04 != 0 && flags & 0x02 != 0,
        ..Default::default()
    };

    if flags & 0x08 != 0 {
        result.energy_expended = reader.u16();
    }

    if flags & 0x10 != 0 {
        while reader.remaining() >= 2 {
            if let Some(rr) = reader.u16() {
                result.rr_intervals.push(rr);
            }
        }
    }

    Some(result)
}

/// Cumulative revolutions and the time of the last event in 1/1024 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevolutionData {
    pub revolutions: u32,
    pub event_time: u16,
}

/// Parsed CSC Measurement. Either part may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CscMeasurement {
    pub wheel: Option<RevolutionData>,
    pub crank: Option<RevolutionData>,
}

/// Parse a CSC Measurement notification.
pub fn parse_csc_measurement(data: &[u8]) -> Option<CscMeasurement> {
    let mut reader = FieldReader::new(data);
    let flags = reader.u8()?;
    let mut result = CscMeasurement::default();

    // Wheel Revolution Data (bit 0): u32 revolutions + u16 event time
    if flags & 0x01 != 0 {
        result.wheel = Some(RevolutionData {
            revolutions: reader.u32()?,
            event_time: reader.u16()?,
        });
    }
    // Crank Revolution Data (bit 1): u16 revolutions + u16 event time
    if flags & 0x02 != 0 {
        result.crank = Some(RevolutionData {
            revolutions: reader.u16()?.into(),
            event_time: reader.u16()?,
        });
    }

    Some(result)
}

/// Turns successive CSC measurements from one sensor into speed and
/// cadence. Counters and event times wrap.
#[derive(Debug, Clone)]
pub struct CscTracker {
    wheel_circumference_m: f64,
    previous: CscMeasurement,
}

impl Default for CscTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WHEEL_CIRCUMFERENCE_M)
    }
}

impl CscTracker {
    pub fn new(wheel_circumference_m: f64) -> Self {
        Self {
            wheel_circumference_m,
            previous: CscMeasurement::default(),
        }
    }

    /// Samples for the interval since the previous measurement. The first
    /// measurement, or one with no new event, yields nothing.
    pub fn update(&mut self, measurement: CscMeasurement, timestamp: Timestamp) -> Vec<Sample> {
        let mut samples = Vec::with_capacity(2);

        if let (Some(prev), Some(now)) = (self.previous.wheel, measurement.wheel) {
            if let Some((revs, secs)) = interval(prev, now, u32::MAX) {
                let kmh = revs * self.wheel_circumference_m / secs * 3.6;
                samples.push(Sample::scalar(MetricKind::Speed, kmh, timestamp));
            }
        }
        if let (Some(prev), Some(now)) = (self.previous.crank, measurement.crank) {
            if let Some((revs, secs)) = interval(prev, now, u16::MAX.into()) {
                samples.push(Sample::scalar(MetricKind::Cadence, revs * 60.0 / secs, timestamp));
            }
        }

        if measurement.wheel.is_some() {
            self.previous.wheel = measurement.wheel;
        }
        if measurement.crank.is_some() {
            self.previous.crank = measurement.crank;
        }
        samples
    }
}

/// Revolutions and seconds between two events, or `None` if no time passed.
fn interval(prev: RevolutionData, now: RevolutionData, counter_max: u32) -> Option<(f64, f64)> {
    let ticks = now.event_time.wrapping_sub(prev.event_time);
    if ticks == 0 {
        return None;
    }
    let revs = now.revolutions.wrapping_sub(prev.revolutions) & counter_max;
    Some((revs as f64, ticks as f64 / 1024.0))
}

/// Parse a Battery Level read or notification (percent).
pub fn parse_battery_level(data: &[u8]) -> Option<u8> {
    data.first().copied().filter(|level| *level <= 100)
}
