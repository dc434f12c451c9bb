//! Power and heart rate zone calculations.
//!
//! Zones are described by ascending upper bounds. A value falls into the zone
//! whose upper bound is the first one strictly greater than it; the last zone
//! is the catch-all above every bound.

use serde::{Deserialize, Serialize};

/// Power zone upper bounds as fractions of FTP (7 zones).
pub const POWER_ZONE_FRACTIONS: [f64; 6] = [0.55, 0.75, 0.90, 1.05, 1.20, 1.50];

/// Heart rate zone upper bounds as fractions of threshold HR (5 zones).
pub const HR_ZONE_FRACTIONS: [f64; 4] = [0.68, 0.83, 0.94, 1.05];

/// Power zone names, indexed by zone.
pub const POWER_ZONE_NAMES: [&str; 7] = [
    "Active Recovery",
    "Endurance",
    "Tempo",
    "Threshold",
    "VO2max",
    "Anaerobic",
    "Neuromuscular",
];

/// Heart rate zone names, indexed by zone.
pub const HR_ZONE_NAMES: [&str; 5] = ["Recovery", "Aerobic", "Tempo", "Threshold", "Maximum"];

/// Zones defined by ascending upper bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneBounds {
    upper_bounds: Vec<f64>,
}

impl ZoneBounds {
    /// Build zones from a reference value and fractional upper bounds.
    pub fn from_fractions(reference: f64, fractions: &[f64]) -> Self {
        Self {
            upper_bounds: fractions.iter().map(|f| reference * f).collect(),
        }
    }

    /// Build zones from explicit upper bounds.
    pub fn from_bounds(upper_bounds: Vec<f64>) -> Self {
        Self { upper_bounds }
    }

    /// Zero-based zone index for `value`.
    pub fn zone_for(&self, value: f64) -> usize {
        self.upper_bounds
            .iter()
            .position(|bound| *bound > value)
            .unwrap_or(self.upper_bounds.len())
    }

    /// Number of zones (bounds + catch-all).
    pub fn zone_count(&self) -> usize {
        self.upper_bounds.len() + 1
    }

    /// Upper bounds in ascending order.
    pub fn upper_bounds(&self) -> &[f64] {
        &self.upper_bounds
    }
}

/// Seven power zones derived from FTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerZones {
    pub bounds: ZoneBounds,
}

impl PowerZones {
    /// Calculate power zones from FTP.
    pub fn from_ftp(ftp: u16) -> Self {
        Self {
            bounds: ZoneBounds::from_fractions(ftp as f64, &POWER_ZONE_FRACTIONS),
        }
    }

    /// Zero-based zone index for a power value.
    pub fn get_zone(&self, power: f64) -> usize {
        self.bounds.zone_for(power)
    }

    /// Zone name for a zero-based index.
    pub fn name(zone: usize) -> Option<&'static str> {
        POWER_ZONE_NAMES.get(zone).copied()
    }
}

/// Five heart rate zones derived from threshold heart rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HRZones {
    pub bounds: ZoneBounds,
}

impl HRZones {
    /// Calculate heart rate zones from threshold HR.
    pub fn from_threshold(threshold_hr: u8) -> Self {
        Self {
            bounds: ZoneBounds::from_fractions(threshold_hr as f64, &HR_ZONE_FRACTIONS),
        }
    }

    /// Zero-based zone index for a heart rate value.
    pub fn get_zone(&self, hr: f64) -> usize {
        self.bounds.zone_for(hr)
    }

    /// Zone name for a zero-based index.
    pub fn name(zone: usize) -> Option<&'static str> {
        HR_ZONE_NAMES.get(zone).copied()
    }
}

/// Longest tick gap credited to a zone; anything longer is discarded.
pub const MAX_ZONE_DELTA_MS: u64 = 60_000;

/// Accumulates time spent in each zone.
///
/// Elapsed time is always credited to the zone observed on the *previous*
/// tick, since that is where the rider spent the interval.
#[derive(Debug, Clone)]
pub struct ZoneTimer {
    buckets: Vec<u64>,
    previous: Option<usize>,
}

impl ZoneTimer {
    /// Create a timer with `zones` empty buckets.
    pub fn new(zones: usize) -> Self {
        Self {
            buckets: vec![0; zones],
            previous: None,
        }
    }

    /// Credit `delta_ms` to the previous zone and remember `current`.
    pub fn advance(&mut self, delta_ms: u64, current: Option<usize>) {
        if delta_ms <= MAX_ZONE_DELTA_MS {
            if let Some(bucket) = self.previous.and_then(|z| self.buckets.get_mut(z)) {
                *bucket += delta_ms;
            }
        } else {
            tracing::debug!("Discarding {}ms zone delta (tick gap)", delta_ms);
        }
        self.previous = current;
    }

    /// Forget the previous zone without crediting anything.
    pub fn interrupt(&mut self) {
        self.previous = None;
    }

    /// Accumulated milliseconds per zone.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }
}
