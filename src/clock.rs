//! Monotonic millisecond clock shared by sensors and the session recorder.

use tokio::time::Instant;

/// Milliseconds since a [`MonotonicClock`]'s origin.
pub type Timestamp = u64;

/// A monotonic clock reporting milliseconds since its creation.
///
/// Built on `tokio::time::Instant` so that tests running on a paused runtime
/// see virtual time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a new clock at zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Current time in milliseconds.
    pub fn now_ms(&self) -> Timestamp {
        Instant::now()
            .saturating_duration_since(self.origin)
            .as_millis() as Timestamp
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
