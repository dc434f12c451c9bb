//! Time-windowed per-metric reading buffer.
//!
//! Each metric owns an append-only, timestamp-ascending sequence of samples.
//! Readers take snapshots under a shared lock; cleanup trims under the
//! exclusive lock, so a reader never observes a half-trimmed sequence.

use crate::clock::{MonotonicClock, Timestamp};
use crate::recording::types::{GeoPoint, MetricKind, Sample};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Per-metric rolling store of raw samples.
#[derive(Debug)]
pub struct ReadingBuffer {
    series: RwLock<HashMap<MetricKind, Vec<Sample>>>,
    retention: Duration,
    clock: MonotonicClock,
}

impl ReadingBuffer {
    /// Create a buffer with the given retention window.
    pub fn new(retention: Duration, clock: MonotonicClock) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            retention,
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<MetricKind, Vec<Sample>>> {
        self.series.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<MetricKind, Vec<Sample>>> {
        self.series.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a sample to its metric's sequence.
    ///
    /// Never rejects. A sample stamped earlier than the sequence tail is
    /// appended with the tail's timestamp so the sequence stays ascending.
    pub fn add(&self, sample: Sample) {
        let mut series = self.write();
        let seq = series.entry(sample.metric).or_default();

        let sample = match seq.last() {
            Some(tail) if sample.timestamp < tail.timestamp => sample.at(tail.timestamp),
            _ => sample,
        };

        seq.push(sample);
    }

    /// Numeric values of `metric` newer than `seconds` ago.
    pub fn recent(&self, metric: MetricKind, seconds: f64) -> Vec<f64> {
        self.recent_at(metric, seconds, self.clock.now_ms())
    }

    /// Numeric values of `metric` with `timestamp > now - seconds * 1000`.
    pub fn recent_at(&self, metric: MetricKind, seconds: f64, now: Timestamp) -> Vec<f64> {
        debug_assert!(!metric.is_positional(), "{metric} holds positions");
        self.recent_samples_at(metric, seconds, now)
            .iter()
            .filter_map(Sample::as_scalar)
            .collect()
    }

    /// Positions newer than `seconds` ago, with their timestamps.
    pub fn recent_positions_at(&self, seconds: f64, now: Timestamp) -> Vec<(Timestamp, GeoPoint)> {
        self.recent_samples_at(MetricKind::Position, seconds, now)
            .iter()
            .filter_map(|s| s.as_position().map(|p| (s.timestamp, p)))
            .collect()
    }

    /// Raw samples of `metric` with `timestamp > now - seconds * 1000`.
    ///
    /// Binary-searches the cutoff, so cost is proportional to the matches.
    pub fn recent_samples_at(&self, metric: MetricKind, seconds: f64, now: Timestamp) -> Vec<Sample> {
        let cutoff = now as f64 - seconds * 1000.0;
        let series = self.read();

        let Some(seq) = series.get(&metric) else {
            return Vec::new();
        };

        let start = seq.partition_point(|s| (s.timestamp as f64) <= cutoff);
        seq[start..].to_vec()
    }

    /// Most recent sample for `metric`, if any.
    pub fn latest(&self, metric: MetricKind) -> Option<Sample> {
        self.read().get(&metric).and_then(|seq| seq.last().copied())
    }

    /// Number of samples held for `metric`.
    pub fn len(&self, metric: MetricKind) -> usize {
        self.read().get(&metric).map_or(0, Vec::len)
    }

    /// Whether the buffer holds no samples at all.
    pub fn is_empty(&self) -> bool {
        self.read().values().all(Vec::is_empty)
    }

    /// Drop samples older than the retention window.
    pub fn cleanup(&self) {
        self.cleanup_at(self.clock.now_ms());
    }

    /// Drop samples with `timestamp < now - retention`.
    pub fn cleanup_at(&self, now: Timestamp) {
        let cutoff = now.saturating_sub(self.retention.as_millis() as Timestamp);
        let mut dropped = 0usize;

        {
            let mut series = self.write();
            for seq in series.values_mut() {
                let start = seq.partition_point(|s| s.timestamp < cutoff);
                if start > 0 {
                    *seq = seq.split_off(start);
                    dropped += start;
                }
            }
        }

        if dropped > 0 {
            tracing::debug!("Reading buffer cleanup dropped {} samples (cutoff {}ms)", dropped, cutoff);
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.write().clear();
    }
}
