//! Recording module: reading buffer, session recorder and its collaborators.

pub mod buffer;
pub mod profile;
pub mod recorder;
pub mod sink;
pub mod types;

pub use buffer::ReadingBuffer;
pub use profile::{Environment, ProfileSource, UserProfile};
pub use recorder::{SessionCore, SessionRecorder};
pub use sink::{MemorySink, PersistenceSink};
pub use types::{
    GeoPoint, MetricKind, RecorderConfig, RecorderError, RecordingStatus, Sample, SampleValue,
    SessionEvent, SessionStats, SinkError, SpeedSource,
};
