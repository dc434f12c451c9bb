//! Persistence sink seam.
//!
//! The recorder hands every accepted reading to a [`PersistenceSink`] and
//! flushes it on the persistence tick. Durable storage of activities lives
//! behind this trait.

use crate::recording::types::{Sample, SinkError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Receiver for recorded readings.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Buffer a numeric reading.
    fn add(&self, sample: &Sample);

    /// Buffer a position reading.
    fn add_position(&self, sample: &Sample);

    /// Write buffered readings. Returns once they are durable.
    async fn flush(&self) -> Result<(), SinkError>;

    /// Whether anything is buffered but not yet flushed.
    fn has_pending_data(&self) -> bool;
}

/// In-memory sink, used headless and in tests.
///
/// Flushing moves pending samples to the flushed list. A failing flush leaves
/// them pending.
#[derive(Debug, Default)]
pub struct MemorySink {
    pending: Mutex<Vec<Sample>>,
    flushed: Mutex<Vec<Sample>>,
    flush_count: AtomicUsize,
    fail_flushes: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent flushes fail (or succeed again).
    pub fn set_fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::SeqCst);
    }

    /// Number of flush calls, successful or not.
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    /// Samples written by successful flushes.
    pub fn flushed(&self) -> Vec<Sample> {
        self.flushed.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Samples waiting for a flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn push(&self, sample: &Sample) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(*sample);
        }
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    fn add(&self, sample: &Sample) {
        self.push(sample);
    }

    fn add_position(&self, sample: &Sample) {
        self.push(sample);
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_flushes.load(Ordering::SeqCst) {
            return Err(SinkError::FlushFailed("simulated write failure".to_string()));
        }

        let drained: Vec<Sample> = self
            .pending
            .lock()
            .map(|mut p| p.drain(..).collect())
            .map_err(|_| SinkError::Closed)?;

        self.flushed
            .lock()
            .map_err(|_| SinkError::Closed)?
            .extend(drained);

        Ok(())
    }

    fn has_pending_data(&self) -> bool {
        self.pending_len() > 0
    }
}
