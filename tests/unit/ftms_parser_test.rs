//! Unit tests for GATT decoding and FTMS wire encoding.

use ridelink::recording::{MetricKind, Sample};
use ridelink::sensors::ftms::{
    build_set_target_power, build_set_target_resistance, parse_control_response,
    parse_indoor_bike_data, parse_supported_range, ControlMode, FtmsOpcode, ResultCode,
    FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
};
use ridelink::sensors::gatt::{
    classify, CscMeasurement, RevolutionData, BATTERY_LEVEL_UUID, CSC_MEASUREMENT_UUID,
    CSC_SERVICE_UUID, CYCLING_POWER_MEASUREMENT_UUID, CYCLING_POWER_SERVICE_UUID,
    HEART_RATE_MEASUREMENT_UUID,
};
use ridelink::sensors::manager::{decode_notification, Decoded};
use ridelink::sensors::types::{Protocol, SensorType};
use uuid::Uuid;

#[test]
fn test_ftms_service_uuid() {
    assert_eq!(
        FTMS_SERVICE_UUID,
        Uuid::from_u128(0x00001826_0000_1000_8000_00805f9b34fb)
    );
}

#[test]
fn test_classify_by_advertised_services() {
    assert_eq!(
        classify(&[CYCLING_POWER_SERVICE_UUID]),
        Some((SensorType::PowerMeter, Protocol::BleCyclingPower))
    );
    assert_eq!(
        classify(&[CSC_SERVICE_UUID]),
        Some((SensorType::SpeedCadence, Protocol::BleCsc))
    );
    assert_eq!(
        classify(&[CYCLING_POWER_SERVICE_UUID, FTMS_SERVICE_UUID]),
        Some((SensorType::Trainer, Protocol::BleFtms))
    );
    assert_eq!(classify(&[Uuid::nil()]), None);
}

#[test]
fn test_indoor_bike_frame_with_heart_rate() {
    // Flags 0x0244: inst cadence, inst power, heart rate
    let data = [0x44, 0x02, 0xC4, 0x09, 0xB4, 0x00, 0xFA, 0x00, 0x8C];
    let frame = parse_indoor_bike_data(&data).unwrap();

    assert_eq!(frame.heart_rate_bpm, Some(140));
    let metrics: Vec<MetricKind> = frame.samples(5).iter().map(|s| s.metric).collect();
    assert_eq!(
        metrics,
        vec![
            MetricKind::Speed,
            MetricKind::Cadence,
            MetricKind::Power,
            MetricKind::HeartRate
        ]
    );
}

#[test]
fn test_indoor_bike_more_data_omits_speed() {
    // Flags 0x0041: more data + inst power
    let frame = parse_indoor_bike_data(&[0x41, 0x00, 0x2C, 0x01]).unwrap();
    assert!(frame.speed_kmh.is_none());
    assert_eq!(frame.power_watts, Some(300));
}

#[test]
fn test_decode_power_notification() {
    let decoded = decode_notification(CYCLING_POWER_MEASUREMENT_UUID, &[0x00, 0x00, 0xC8, 0x00], 42);
    assert_eq!(
        decoded,
        Decoded::Samples(vec![Sample::scalar(MetricKind::Power, 200.0, 42)])
    );
}

#[test]
fn test_decode_heart_rate_and_battery() {
    assert_eq!(
        decode_notification(HEART_RATE_MEASUREMENT_UUID, &[0x00, 0x91], 7),
        Decoded::Samples(vec![Sample::scalar(MetricKind::HeartRate, 145.0, 7)])
    );
    assert_eq!(decode_notification(BATTERY_LEVEL_UUID, &[64], 0), Decoded::Battery(64));
    assert_eq!(decode_notification(BATTERY_LEVEL_UUID, &[101], 0), Decoded::Unknown);
}

#[test]
fn test_decode_csc_keeps_raw_counters() {
    // Wheel only: 300 revs @ 512
    let data = [0x01, 0x2C, 0x01, 0x00, 0x00, 0x00, 0x02];
    assert_eq!(
        decode_notification(CSC_MEASUREMENT_UUID, &data, 0),
        Decoded::Csc(CscMeasurement {
            wheel: Some(RevolutionData {
                revolutions: 300,
                event_time: 512
            }),
            crank: None,
        })
    );
    assert_eq!(decode_notification(CSC_MEASUREMENT_UUID, &[0x01, 0x2C], 0), Decoded::Unknown);
}

#[test]
fn test_decode_routes_control_indications() {
    assert_eq!(
        decode_notification(FTMS_CONTROL_POINT_UUID, &[0x80, 0x05, 0x01], 0),
        Decoded::ControlIndication
    );
    assert_eq!(decode_notification(INDOOR_BIKE_DATA_UUID, &[0x00], 0), Decoded::Unknown);
}

#[test]
fn test_power_target_little_endian() {
    assert_eq!(build_set_target_power(0.0), vec![0x05, 0x00, 0x00]);
    assert_eq!(build_set_target_power(1000.0), vec![0x05, 0xE8, 0x03]);
    assert_eq!(build_set_target_power(300.0)[0], FtmsOpcode::SetTargetPower as u8);
}

#[test]
fn test_resistance_uses_tenth_resolution() {
    assert_eq!(build_set_target_resistance(20.0), vec![0x04, 0xC8]);
    // One byte on the wire: saturates past 25.5
    assert_eq!(build_set_target_resistance(30.0), vec![0x04, 0xFF]);
}

#[test]
fn test_response_result_codes() {
    let ok = parse_control_response(&[0x80, 0x11, 0x01]).unwrap();
    assert_eq!(ok.result, ResultCode::Success);

    let denied = parse_control_response(&[0x80, 0x05, 0x05]).unwrap();
    assert_eq!(denied.result, ResultCode::ControlNotPermitted);
    assert!(!denied.result.is_success());
}

#[test]
fn test_resistance_range_parsing() {
    // min 0.0, max 100.0, increment 1.0 (tenths)
    let data = [0x00, 0x00, 0xE8, 0x03, 0x0A, 0x00];
    let range = parse_supported_range(ControlMode::Resistance, &data).unwrap();
    assert_eq!((range.min, range.max, range.increment), (0.0, 100.0, 1.0));

    // Inverted range is rejected
    let inverted = [0xE8, 0x03, 0x00, 0x00, 0x01, 0x00];
    assert!(parse_supported_range(ControlMode::Power, &inverted).is_none());
}
