//! Physiological range checks for incoming samples.

use crate::recording::types::{MetricKind, Sample, SampleValue};

/// Accepted inclusive range for a numeric metric.
pub fn valid_range(metric: MetricKind) -> Option<(f64, f64)> {
    match metric {
        MetricKind::HeartRate => Some((30.0, 250.0)),
        MetricKind::Power => Some((0.0, 4000.0)),
        MetricKind::Cadence => Some((0.0, 250.0)),
        MetricKind::Speed => Some((0.0, 150.0)),
        MetricKind::Temperature => Some((-40.0, 60.0)),
        MetricKind::Position => None,
    }
}

/// Whether a sample is plausible.
pub fn is_valid(sample: &Sample) -> bool {
    match sample.value {
        SampleValue::Scalar(v) => {
            v.is_finite()
                && valid_range(sample.metric).map_or(true, |(lo, hi)| v >= lo && v <= hi)
        }
        SampleValue::Pair(lat, lon) => {
            (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
        }
    }
}
