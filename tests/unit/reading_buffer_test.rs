//! Unit tests for the windowed reading buffer.

use ridelink::clock::MonotonicClock;
use ridelink::recording::{GeoPoint, MetricKind, ReadingBuffer, Sample};
use std::time::Duration;

fn buffer() -> ReadingBuffer {
    ReadingBuffer::new(Duration::from_secs(60), MonotonicClock::new())
}

fn power(value: f64, ts: u64) -> Sample {
    Sample::scalar(MetricKind::Power, value, ts)
}

#[test]
fn test_window_excludes_boundary_sample() {
    let buf = buffer();
    buf.add(power(100.0, 7000));
    buf.add(power(200.0, 8000));
    buf.add(power(300.0, 9500));

    // now - 3s = 7000; timestamps must be strictly newer
    assert_eq!(buf.recent_at(MetricKind::Power, 3.0, 10_000), vec![200.0, 300.0]);
    assert_eq!(buf.recent_at(MetricKind::Power, 0.25, 10_000), Vec::<f64>::new());
}

#[test]
fn test_metrics_are_kept_apart() {
    let buf = buffer();
    buf.add(power(250.0, 1000));
    buf.add(Sample::scalar(MetricKind::HeartRate, 150.0, 1000));

    assert_eq!(buf.len(MetricKind::Power), 1);
    assert_eq!(buf.len(MetricKind::HeartRate), 1);
    assert_eq!(buf.len(MetricKind::Cadence), 0);
    assert_eq!(buf.latest(MetricKind::HeartRate).and_then(|s| s.as_scalar()), Some(150.0));
}

#[test]
fn test_late_sample_is_clamped_to_tail() {
    let buf = buffer();
    buf.add(power(100.0, 5000));
    buf.add(power(120.0, 4000));

    let latest = buf.latest(MetricKind::Power).unwrap();
    assert_eq!(latest.timestamp, 5000);
    assert_eq!(latest.as_scalar(), Some(120.0));
    assert_eq!(buf.len(MetricKind::Power), 2);
}

#[test]
fn test_cleanup_respects_retention() {
    let buf = buffer();
    buf.add(power(100.0, 0));
    buf.add(power(110.0, 30_000));
    buf.add(power(120.0, 70_000));

    // cutoff 10s: only the sample at 0 is older
    buf.cleanup_at(70_000);
    assert_eq!(buf.len(MetricKind::Power), 2);

    buf.cleanup_at(200_000);
    assert_eq!(buf.len(MetricKind::Power), 0);
    assert!(buf.is_empty());
}

#[test]
fn test_positions_carry_timestamps() {
    let buf = buffer();
    buf.add(Sample::position(GeoPoint::new(51.5, -0.12), 1000));
    buf.add(Sample::position(GeoPoint::new(51.5001, -0.12), 2000));

    let track = buf.recent_positions_at(3.0, 2000);
    assert_eq!(track.len(), 2);
    assert_eq!(track[0].0, 1000);
    assert_eq!(track[1].1, GeoPoint::new(51.5001, -0.12));
}

#[test]
fn test_clear_drops_everything() {
    let buf = buffer();
    buf.add(power(100.0, 0));
    buf.add(Sample::scalar(MetricKind::Cadence, 90.0, 0));

    buf.clear();
    assert!(buf.is_empty());
    assert!(buf.latest(MetricKind::Cadence).is_none());
}
