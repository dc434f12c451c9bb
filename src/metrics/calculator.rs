//! Running statistics and training-load estimates.
//!
//! Normalized power here is an approximation: the mean of the last 30s of
//! power scaled by 1.05. It is not the 4th-power rolling algorithm, so IF,
//! TSS, VI and EF derived from it are estimates as well.

use crate::recording::types::{MetricKind, Sample};
use std::collections::HashMap;

/// Window used for the normalized power estimate.
pub const NP_WINDOW_SECS: f64 = 30.0;
/// Scale applied to the windowed mean.
const NP_SCALE: f64 = 1.05;

/// Running sum, count and maximum for one metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStat {
    sum: f64,
    count: u64,
    max: Option<f64>,
}

impl RunningStat {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Training-load estimates derived from normalized power.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadEstimate {
    pub normalized_power: Option<f64>,
    pub intensity_factor: Option<f64>,
    pub tss: Option<f64>,
    pub variability_index: Option<f64>,
    pub efficiency_factor: Option<f64>,
}

/// Normalized power estimate from recent power values.
pub fn estimate_normalized_power(recent_power: &[f64]) -> Option<f64> {
    if recent_power.is_empty() {
        return None;
    }
    let mean = recent_power.iter().sum::<f64>() / recent_power.len() as f64;
    Some(mean * NP_SCALE)
}

/// Derive NP, IF, TSS, VI and EF.
pub fn estimate_load(
    recent_power: &[f64],
    ftp: Option<f64>,
    avg_power: Option<f64>,
    avg_hr: Option<f64>,
    moving_secs: f64,
) -> LoadEstimate {
    let Some(np) = estimate_normalized_power(recent_power) else {
        return LoadEstimate::default();
    };

    let ftp = ftp.filter(|f| *f > 0.0);
    let intensity_factor = ftp.map(|ftp| np / ftp);
    let tss = match (ftp, intensity_factor) {
        (Some(ftp), Some(if_value)) => Some((moving_secs * np * if_value) / (ftp * 3600.0) * 100.0),
        _ => None,
    };

    LoadEstimate {
        normalized_power: Some(np),
        intensity_factor,
        tss,
        variability_index: avg_power.filter(|p| *p > 0.0).map(|p| np / p),
        efficiency_factor: avg_hr.filter(|hr| *hr > 0.0).map(|hr| np / hr),
    }
}

/// Per-metric running statistics for a session.
#[derive(Debug, Clone, Default)]
pub struct MetricsCalculator {
    stats: HashMap<MetricKind, RunningStat>,
}

impl MetricsCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a numeric sample into its metric's statistics.
    pub fn record(&mut self, sample: &Sample) {
        if let Some(value) = sample.as_scalar() {
            self.stats.entry(sample.metric).or_default().add(value);
        }
    }

    /// Average of every recorded value of `metric`.
    pub fn average(&self, metric: MetricKind) -> Option<f64> {
        self.stats.get(&metric).and_then(RunningStat::avg)
    }

    /// Maximum recorded value of `metric`.
    pub fn maximum(&self, metric: MetricKind) -> Option<f64> {
        self.stats.get(&metric).and_then(RunningStat::max)
    }

    /// Reset all statistics for a new session.
    pub fn reset(&mut self) {
        self.stats.clear();
    }
}
