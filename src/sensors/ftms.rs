//! FTMS (Fitness Machine Service) wire protocol.
//!
//! Indoor Bike Data parsing, feature and supported-range decoding, control
//! point command encoding and response decoding. All multi-byte fields are
//! little-endian.

use crate::clock::Timestamp;
use crate::recording::types::{MetricKind, Sample};
use crate::sensors::gatt::FieldReader;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// FTMS Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data Characteristic UUID (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point UUID (0x2AD9)
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Feature UUID (0x2ACC)
pub const FTMS_FEATURE_UUID: Uuid = Uuid::from_u128(0x0000_2acc_0000_1000_8000_0080_5f9b_34fb);

/// Supported Speed Range UUID (0x2AD4)
pub const SUPPORTED_SPEED_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad4_0000_1000_8000_0080_5f9b_34fb);

/// Supported Inclination Range UUID (0x2AD5)
pub const SUPPORTED_INCLINATION_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad5_0000_1000_8000_0080_5f9b_34fb);

/// Supported Resistance Level Range UUID (0x2AD6)
pub const SUPPORTED_RESISTANCE_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad6_0000_1000_8000_0080_5f9b_34fb);

/// Supported Heart Rate Range UUID (0x2AD7)
pub const SUPPORTED_HEART_RATE_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad7_0000_1000_8000_0080_5f9b_34fb);

/// Supported Power Range UUID (0x2AD8)
pub const SUPPORTED_POWER_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad8_0000_1000_8000_0080_5f9b_34fb);

/// Parsed data from Indoor Bike Data characteristic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndoorBikeData {
    /// Instantaneous speed in km/h (if present)
    pub speed_kmh: Option<f64>,
    /// Average speed in km/h (if present)
    pub avg_speed_kmh: Option<f64>,
    /// Instantaneous cadence in RPM (if present)
    pub cadence_rpm: Option<f64>,
    /// Average cadence in RPM (if present)
    pub avg_cadence_rpm: Option<f64>,
    /// Total distance in meters (if present)
    pub total_distance_m: Option<u32>,
    /// Resistance level (if present)
    pub resistance_level: Option<i16>,
    /// Instantaneous power in watts (if present)
    pub power_watts: Option<i16>,
    /// Average power in watts (if present)
    pub avg_power_watts: Option<i16>,
    /// Expended energy in kCal (if present)
    pub energy_kcal: Option<u16>,
    /// Heart rate in BPM (if present)
    pub heart_rate_bpm: Option<u8>,
    /// Metabolic equivalent in 0.1 units (if present)
    pub metabolic_equivalent: Option<u8>,
    /// Elapsed time in seconds (if present)
    pub elapsed_time_s: Option<u16>,
    /// Remaining time in seconds (if present)
    pub remaining_time_s: Option<u16>,
}

impl IndoorBikeData {
    /// Samples carried by this frame.
    ///
    /// Instantaneous cadence wins; average cadence is used only when the
    /// instantaneous field is absent. Average power is logged, never emitted.
    pub fn samples(&self, timestamp: Timestamp) -> Vec<Sample> {
        let mut samples = Vec::with_capacity(4);

        if let Some(speed) = self.speed_kmh {
            samples.push(Sample::scalar(MetricKind::Speed, speed, timestamp));
        }
        if let Some(cadence) = self.cadence_rpm.or(self.avg_cadence_rpm) {
            samples.push(Sample::scalar(MetricKind::Cadence, cadence, timestamp));
        }
        if let Some(power) = self.power_watts {
            samples.push(Sample::scalar(MetricKind::Power, power as f64, timestamp));
        }
        if let Some(avg_power) = self.avg_power_watts {
            tracing::trace!("Indoor bike data average power: {}W", avg_power);
        }
        if let Some(hr) = self.heart_rate_bpm {
            samples.push(Sample::scalar(MetricKind::HeartRate, hr as f64, timestamp));
        }

        samples
    }
}

/// Parse an Indoor Bike Data notification.
///
/// Bytes 0-1 are flags. Instantaneous speed is present when the "More Data"
/// bit (0) is clear; every other field follows in flag order.
pub fn parse_indoor_bike_data(data: &[u8]) -> Option<IndoorBikeData> {
    let mut reader = FieldReader::new(data);
    let flags = reader.u16()?;
    let has = |bit: u16| flags & (1 << bit) != 0;
    let mut result = IndoorBikeData::default();

    if !has(0) {
        result.speed_kmh = Some(reader.u16()? as f64 / 100.0);
    }
    if has(1) {
        result.avg_speed_kmh = Some(reader.u16()? as f64 / 100.0);
    }
    if has(2) {
        result.cadence_rpm = Some(reader.u16()? as f64 / 2.0);
    }
    if has(3) {
        result.avg_cadence_rpm = Some(reader.u16()? as f64 / 2.0);
    }
    if has(4) {
        result.total_distance_m = Some(reader.u24()?);
    }
    if has(5) {
        result.resistance_level = Some(reader.i16()?);
    }
    if has(6) {
        result.power_watts = Some(reader.i16()?);
    }
    if has(7) {
        result.avg_power_watts = Some(reader.i16()?);
    }
    if has(8) {
        // Total energy, then per hour (u16) and per minute (u8)
        result.energy_kcal = Some(reader.u16()?);
        reader.skip(3)?;
    }
    if has(9) {
        result.heart_rate_bpm = Some(reader.u8()?);
    }
    if has(10) {
        result.metabolic_equivalent = Some(reader.u8()?);
    }
    if has(11) {
        result.elapsed_time_s = Some(reader.u16()?);
    }
    if has(12) {
        result.remaining_time_s = Some(reader.u16()?);
    }

    Some(result)
}

/// Fitness Machine Features (first feature word).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFeatures {
    pub average_speed: bool,
    pub cadence: bool,
    pub total_distance: bool,
    pub inclination: bool,
    pub elevation_gain: bool,
    pub pace: bool,
    pub step_count: bool,
    pub resistance_level: bool,
    pub stride_count: bool,
    pub expended_energy: bool,
    pub heart_rate_measurement: bool,
    pub metabolic_equivalent: bool,
    pub elapsed_time: bool,
    pub remaining_time: bool,
    pub power_measurement: bool,
    pub force_on_belt_and_power_output: bool,
    pub user_data_retention: bool,
}

impl MachineFeatures {
    pub fn from_bits(bits: u32) -> Self {
        let has = |bit: u32| bits & (1 << bit) != 0;
        Self {
            average_speed: has(0),
            cadence: has(1),
            total_distance: has(2),
            inclination: has(3),
            elevation_gain: has(4),
            pace: has(5),
            step_count: has(6),
            resistance_level: has(7),
            stride_count: has(8),
            expended_energy: has(9),
            heart_rate_measurement: has(10),
            metabolic_equivalent: has(11),
            elapsed_time: has(12),
            remaining_time: has(13),
            power_measurement: has(14),
            force_on_belt_and_power_output: has(15),
            user_data_retention: has(16),
        }
    }
}

/// Target Setting Features (second feature word).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSettingFeatures {
    pub speed_target: bool,
    pub inclination_target: bool,
    pub resistance_target: bool,
    pub power_target: bool,
    pub heart_rate_target: bool,
    pub targeted_expended_energy: bool,
    pub targeted_step_number: bool,
    pub targeted_stride_number: bool,
    pub targeted_distance: bool,
    pub targeted_training_time: bool,
    pub targeted_time_in_two_hr_zones: bool,
    pub targeted_time_in_three_hr_zones: bool,
    pub targeted_time_in_five_hr_zones: bool,
    pub indoor_bike_simulation: bool,
    pub wheel_circumference: bool,
    pub spin_down_control: bool,
    pub targeted_cadence: bool,
}

impl TargetSettingFeatures {
    pub fn from_bits(bits: u32) -> Self {
        let has = |bit: u32| bits & (1 << bit) != 0;
        Self {
            speed_target: has(0),
            inclination_target: has(1),
            resistance_target: has(2),
            power_target: has(3),
            heart_rate_target: has(4),
            targeted_expended_energy: has(5),
            targeted_step_number: has(6),
            targeted_stride_number: has(7),
            targeted_distance: has(8),
            targeted_training_time: has(9),
            targeted_time_in_two_hr_zones: has(10),
            targeted_time_in_three_hr_zones: has(11),
            targeted_time_in_five_hr_zones: has(12),
            indoor_bike_simulation: has(13),
            wheel_circumference: has(14),
            spin_down_control: has(15),
            targeted_cadence: has(16),
        }
    }
}

/// Decoded Fitness Machine Feature characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub machine: MachineFeatures,
    pub targets: TargetSettingFeatures,
}

impl FeatureSet {
    /// Whether a control mode is advertised.
    pub fn supports(&self, mode: ControlMode) -> bool {
        let t = &self.targets;
        match mode {
            ControlMode::Power => t.power_target,
            ControlMode::Simulation => t.indoor_bike_simulation,
            ControlMode::Resistance => t.resistance_target,
            ControlMode::Speed => t.speed_target,
            ControlMode::Inclination => t.inclination_target,
            ControlMode::HeartRate => t.heart_rate_target,
            ControlMode::Cadence => t.targeted_cadence,
        }
    }
}

/// Parse the Fitness Machine Feature characteristic (two u32 words).
pub fn parse_features(data: &[u8]) -> Option<FeatureSet> {
    let mut reader = FieldReader::new(data);
    let machine = reader.u32()?;
    let targets = reader.u32()?;
    Some(FeatureSet {
        machine: MachineFeatures::from_bits(machine),
        targets: TargetSettingFeatures::from_bits(targets),
    })
}

/// A supported value range in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupportedRange {
    pub min: f64,
    pub max: f64,
    pub increment: f64,
}

impl SupportedRange {
    pub const fn new(min: f64, max: f64, increment: f64) -> Self {
        Self { min, max, increment }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Parse a supported-range characteristic for `mode`.
pub fn parse_supported_range(mode: ControlMode, data: &[u8]) -> Option<SupportedRange> {
    let mut r = FieldReader::new(data);
    let range = match mode {
        ControlMode::Speed => SupportedRange::new(
            r.u16()? as f64 / 100.0,
            r.u16()? as f64 / 100.0,
            r.u16()? as f64 / 100.0,
        ),
        ControlMode::Inclination => SupportedRange::new(
            r.i16()? as f64 / 10.0,
            r.i16()? as f64 / 10.0,
            r.u16()? as f64 / 10.0,
        ),
        ControlMode::Resistance => SupportedRange::new(
            r.i16()? as f64 / 10.0,
            r.i16()? as f64 / 10.0,
            r.u16()? as f64 / 10.0,
        ),
        ControlMode::HeartRate => {
            SupportedRange::new(r.u8()? as f64, r.u8()? as f64, r.u8()? as f64)
        }
        ControlMode::Power => {
            SupportedRange::new(r.i16()? as f64, r.i16()? as f64, r.u16()? as f64)
        }
        ControlMode::Simulation | ControlMode::Cadence => return None,
    };
    (range.min <= range.max).then_some(range)
}

/// The resistance target is a u8 in tenths, although the advertised range
/// is i16.
const RESISTANCE_WIRE_RANGE: SupportedRange = SupportedRange::new(0.0, 25.5, 0.1);

/// Mutually exclusive trainer control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// ERG: hold a target power
    Power,
    /// SIM: emulate grade, wind and rolling resistance
    Simulation,
    /// Fixed resistance level
    Resistance,
    /// Target speed
    Speed,
    /// Target inclination
    Inclination,
    /// Target heart rate
    HeartRate,
    /// Target cadence
    Cadence,
}

impl ControlMode {
    pub const ALL: [ControlMode; 7] = [
        ControlMode::Power,
        ControlMode::Simulation,
        ControlMode::Resistance,
        ControlMode::Speed,
        ControlMode::Inclination,
        ControlMode::HeartRate,
        ControlMode::Cadence,
    ];

    /// Control point opcode that sets this mode's target.
    pub fn opcode(&self) -> FtmsOpcode {
        match self {
            ControlMode::Power => FtmsOpcode::SetTargetPower,
            ControlMode::Simulation => FtmsOpcode::SetIndoorBikeSimulation,
            ControlMode::Resistance => FtmsOpcode::SetTargetResistanceLevel,
            ControlMode::Speed => FtmsOpcode::SetTargetSpeed,
            ControlMode::Inclination => FtmsOpcode::SetTargetInclination,
            ControlMode::HeartRate => FtmsOpcode::SetTargetHeartRate,
            ControlMode::Cadence => FtmsOpcode::SetTargetedCadence,
        }
    }

    /// Characteristic advertising this mode's supported range, if any.
    pub fn range_characteristic(&self) -> Option<Uuid> {
        match self {
            ControlMode::Power => Some(SUPPORTED_POWER_RANGE_UUID),
            ControlMode::Resistance => Some(SUPPORTED_RESISTANCE_RANGE_UUID),
            ControlMode::Speed => Some(SUPPORTED_SPEED_RANGE_UUID),
            ControlMode::Inclination => Some(SUPPORTED_INCLINATION_RANGE_UUID),
            ControlMode::HeartRate => Some(SUPPORTED_HEART_RATE_RANGE_UUID),
            ControlMode::Simulation | ControlMode::Cadence => None,
        }
    }

    /// Range the target parameter can carry when it is narrower than what
    /// a device may advertise.
    pub fn wire_range(&self) -> Option<SupportedRange> {
        match self {
            ControlMode::Resistance => Some(RESISTANCE_WIRE_RANGE),
            _ => None,
        }
    }

    /// Conservative range used when the device advertises none.
    pub fn default_range(&self) -> SupportedRange {
        match self {
            ControlMode::Power => SupportedRange::new(0.0, 2000.0, 1.0),
            ControlMode::Simulation => SupportedRange::new(-20.0, 20.0, 0.01),
            ControlMode::Resistance => RESISTANCE_WIRE_RANGE,
            ControlMode::Speed => SupportedRange::new(0.0, 60.0, 0.01),
            ControlMode::Inclination => SupportedRange::new(-10.0, 20.0, 0.1),
            ControlMode::HeartRate => SupportedRange::new(60.0, 200.0, 1.0),
            ControlMode::Cadence => SupportedRange::new(20.0, 150.0, 0.5),
        }
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::Power => write!(f, "ERG"),
            ControlMode::Simulation => write!(f, "SIM"),
            ControlMode::Resistance => write!(f, "Resistance"),
            ControlMode::Speed => write!(f, "Speed"),
            ControlMode::Inclination => write!(f, "Inclination"),
            ControlMode::HeartRate => write!(f, "Heart Rate"),
            ControlMode::Cadence => write!(f, "Cadence"),
        }
    }
}

/// FTMS Control Point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FtmsOpcode {
    /// Request control of the fitness machine
    RequestControl = 0x00,
    /// Reset the fitness machine
    Reset = 0x01,
    /// Set target speed
    SetTargetSpeed = 0x02,
    /// Set target inclination
    SetTargetInclination = 0x03,
    /// Set target resistance level
    SetTargetResistanceLevel = 0x04,
    /// Set target power
    SetTargetPower = 0x05,
    /// Set target heart rate
    SetTargetHeartRate = 0x06,
    /// Start or resume training
    StartOrResume = 0x07,
    /// Stop or pause training
    StopOrPause = 0x08,
    /// Set indoor bike simulation parameters
    SetIndoorBikeSimulation = 0x11,
    /// Set targeted cadence
    SetTargetedCadence = 0x14,
    /// Response code prefix
    ResponseCode = 0x80,
}

impl FtmsOpcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => FtmsOpcode::RequestControl,
            0x01 => FtmsOpcode::Reset,
            0x02 => FtmsOpcode::SetTargetSpeed,
            0x03 => FtmsOpcode::SetTargetInclination,
            0x04 => FtmsOpcode::SetTargetResistanceLevel,
            0x05 => FtmsOpcode::SetTargetPower,
            0x06 => FtmsOpcode::SetTargetHeartRate,
            0x07 => FtmsOpcode::StartOrResume,
            0x08 => FtmsOpcode::StopOrPause,
            0x11 => FtmsOpcode::SetIndoorBikeSimulation,
            0x14 => FtmsOpcode::SetTargetedCadence,
            0x80 => FtmsOpcode::ResponseCode,
            _ => return None,
        })
    }
}

/// Control point result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    NotSupported,
    InvalidParameter,
    OperationFailed,
    ControlNotPermitted,
    Unknown(u8),
}

impl ResultCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => ResultCode::Success,
            0x02 => ResultCode::NotSupported,
            0x03 => ResultCode::InvalidParameter,
            0x04 => ResultCode::OperationFailed,
            0x05 => ResultCode::ControlNotPermitted,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Success => write!(f, "success"),
            ResultCode::NotSupported => write!(f, "op code not supported"),
            ResultCode::InvalidParameter => write!(f, "invalid parameter"),
            ResultCode::OperationFailed => write!(f, "operation failed"),
            ResultCode::ControlNotPermitted => write!(f, "control not permitted"),
            ResultCode::Unknown(code) => write!(f, "unknown result 0x{code:02X}"),
        }
    }
}

/// A decoded control point indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Opcode byte echoed from the request
    pub request_opcode: u8,
    pub result: ResultCode,
    /// Trailing response parameters
    pub parameters: Vec<u8>,
}

/// Parse a control point indication: `0x80, request opcode, result, params..`.
pub fn parse_control_response(data: &[u8]) -> Option<ControlResponse> {
    match data {
        [0x80, request_opcode, result, parameters @ ..] => Some(ControlResponse {
            request_opcode: *request_opcode,
            result: ResultCode::from_byte(*result),
            parameters: parameters.to_vec(),
        }),
        _ => None,
    }
}

/// Indoor bike simulation parameters in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Wind speed in m/s (headwind positive)
    pub wind_speed_ms: f64,
    /// Grade in percent
    pub grade_percent: f64,
    /// Coefficient of rolling resistance
    pub crr: f64,
    /// Wind resistance coefficient in kg/m
    pub cw: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            wind_speed_ms: 0.0,
            grade_percent: 0.0,
            crr: 0.004,
            cw: 0.51,
        }
    }
}

fn to_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn to_u16(value: f64) -> u16 {
    value.round().clamp(0.0, u16::MAX as f64) as u16
}

fn to_u8(value: f64) -> u8 {
    value.round().clamp(0.0, u8::MAX as f64) as u8
}

fn command(opcode: FtmsOpcode, payload: &[u8]) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(1 + payload.len());
    cmd.push(opcode as u8);
    cmd.extend_from_slice(payload);
    cmd
}

/// Request control of the machine.
pub fn build_request_control() -> Vec<u8> {
    command(FtmsOpcode::RequestControl, &[])
}

/// Reset the machine (clears any active target).
pub fn build_reset() -> Vec<u8> {
    command(FtmsOpcode::Reset, &[])
}

/// Start or resume training.
pub fn build_start_training() -> Vec<u8> {
    command(FtmsOpcode::StartOrResume, &[])
}

/// Stop (`pause == false`) or pause training.
pub fn build_stop_training(pause: bool) -> Vec<u8> {
    command(FtmsOpcode::StopOrPause, &[if pause { 0x02 } else { 0x01 }])
}

/// ERG target, 1 W resolution.
pub fn build_set_target_power(watts: f64) -> Vec<u8> {
    command(FtmsOpcode::SetTargetPower, &to_i16(watts).to_le_bytes())
}

/// Simulation parameters: wind ×1000, grade ×100 (i16); crr ×10000, cw ×100 (u8).
pub fn build_set_simulation(params: &SimulationParams) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&to_i16(params.wind_speed_ms * 1000.0).to_le_bytes());
    payload.extend_from_slice(&to_i16(params.grade_percent * 100.0).to_le_bytes());
    payload.push(to_u8(params.crr * 10_000.0));
    payload.push(to_u8(params.cw * 100.0));
    command(FtmsOpcode::SetIndoorBikeSimulation, &payload)
}

/// Resistance level, u8 at 0.1 resolution.
pub fn build_set_target_resistance(level: f64) -> Vec<u8> {
    command(FtmsOpcode::SetTargetResistanceLevel, &[to_u8(level * 10.0)])
}

/// Speed target in km/h, 0.01 resolution.
pub fn build_set_target_speed(kmh: f64) -> Vec<u8> {
    command(FtmsOpcode::SetTargetSpeed, &to_u16(kmh * 100.0).to_le_bytes())
}

/// Inclination target in percent, 0.1 resolution.
pub fn build_set_target_inclination(percent: f64) -> Vec<u8> {
    command(FtmsOpcode::SetTargetInclination, &to_i16(percent * 10.0).to_le_bytes())
}

/// Heart rate target, 1 bpm resolution.
pub fn build_set_target_heart_rate(bpm: f64) -> Vec<u8> {
    command(FtmsOpcode::SetTargetHeartRate, &[to_u8(bpm)])
}

/// Cadence target, 0.5 rpm resolution.
pub fn build_set_target_cadence(rpm: f64) -> Vec<u8> {
    command(FtmsOpcode::SetTargetedCadence, &to_u16(rpm * 2.0).to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_indoor_bike_data_speed_only() {
        // Flags: 0x0000, speed 2500 = 25.00 km/h
        let data = [0x00, 0x00, 0xC4, 0x09];
        let result = parse_indoor_bike_data(&data).unwrap();

        assert!((result.speed_kmh.unwrap() - 25.0).abs() < 0.01);
        assert!(result.power_watts.is_none());
        assert!(result.cadence_rpm.is_none());
    }

    #[test]
    fn test_parse_indoor_bike_data_with_power_and_cadence() {
        // Flags: 0x0044 (inst cadence + inst power)
        // Speed 30.00 km/h, cadence 180 = 90 RPM, power 250W
        let data = [0x44, 0x00, 0xB8, 0x0B, 0xB4, 0x00, 0xFA, 0x00];
        let result = parse_indoor_bike_data(&data).unwrap();

        assert!((result.speed_kmh.unwrap() - 30.0).abs() < 0.01);
        assert_eq!(result.cadence_rpm, Some(90.0));
        assert_eq!(result.power_watts, Some(250));
    }

    #[test]
    fn test_parse_indoor_bike_data_truncated() {
        // Power flagged but missing
        assert!(parse_indoor_bike_data(&[0x41, 0x00, 0xFA]).is_none());
        assert!(parse_indoor_bike_data(&[0x00]).is_none());
    }

    #[test]
    fn test_average_cadence_used_only_without_instantaneous() {
        // Flags 0x0089: more data, avg cadence, avg power
        let data = [0x89, 0x00, 0xA0, 0x00, 0x2C, 0x01];
        let frame = parse_indoor_bike_data(&data).unwrap();
        let samples = frame.samples(10);

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].metric, MetricKind::Cadence);
        assert_eq!(samples[0].as_scalar(), Some(80.0));
        // Average power is never emitted
        assert!(samples.iter().all(|s| s.metric != MetricKind::Power));
    }

    #[test]
    fn test_parse_features() {
        // Machine: cadence (bit 1) + power measurement (bit 14)
        // Targets: power (bit 3) + simulation (bit 13)
        let machine: u32 = (1 << 1) | (1 << 14);
        let targets: u32 = (1 << 3) | (1 << 13);
        let mut data = machine.to_le_bytes().to_vec();
        data.extend_from_slice(&targets.to_le_bytes());

        let features = parse_features(&data).unwrap();
        assert!(features.machine.cadence);
        assert!(features.machine.power_measurement);
        assert!(!features.machine.heart_rate_measurement);
        assert!(features.supports(ControlMode::Power));
        assert!(features.supports(ControlMode::Simulation));
        assert!(!features.supports(ControlMode::Resistance));

        assert!(parse_features(&data[..6]).is_none());
    }

    #[test]
    fn test_parse_power_range() {
        // min 0, max 1500, increment 1
        let data = [0x00, 0x00, 0xDC, 0x05, 0x01, 0x00];
        let range = parse_supported_range(ControlMode::Power, &data).unwrap();
        assert_eq!(range, SupportedRange::new(0.0, 1500.0, 1.0));
    }

    #[test]
    fn test_build_set_target_power() {
        assert_eq!(build_set_target_power(250.0), vec![0x05, 0xFA, 0x00]);
    }

    #[test]
    fn test_build_set_simulation() {
        let params = SimulationParams {
            wind_speed_ms: 0.0,
            grade_percent: 5.0,
            crr: 0.004,
            cw: 0.51,
        };
        // grade 500 = 0x01F4, crr 40, cw 51
        assert_eq!(
            build_set_simulation(&params),
            vec![0x11, 0x00, 0x00, 0xF4, 0x01, 40, 51]
        );
    }

    #[test]
    fn test_fixed_point_resolutions() {
        assert_eq!(build_set_target_speed(25.5), vec![0x02, 0xF6, 0x09]);
        assert_eq!(build_set_target_inclination(-2.5), vec![0x03, 0xE7, 0xFF]);
        assert_eq!(build_set_target_resistance(12.3), vec![0x04, 0x7B]);
        assert_eq!(build_set_target_heart_rate(145.0), vec![0x06, 145]);
        assert_eq!(build_set_target_cadence(90.5), vec![0x14, 0xB5, 0x00]);
    }

    #[test]
    fn test_session_commands() {
        assert_eq!(build_request_control(), vec![0x00]);
        assert_eq!(build_reset(), vec![0x01]);
        assert_eq!(build_start_training(), vec![0x07]);
        assert_eq!(build_stop_training(true), vec![0x08, 0x02]);
    }

    #[test]
    fn test_parse_control_response() {
        let resp = parse_control_response(&[0x80, 0x05, 0x01]).unwrap();
        assert_eq!(resp.request_opcode, 0x05);
        assert!(resp.result.is_success());
        assert!(resp.parameters.is_empty());

        let resp = parse_control_response(&[0x80, 0x04, 0x02, 0xAA]).unwrap();
        assert_eq!(resp.result, ResultCode::NotSupported);
        assert_eq!(resp.parameters, vec![0xAA]);

        assert!(parse_control_response(&[0x05, 0x01]).is_none());
    }
}
