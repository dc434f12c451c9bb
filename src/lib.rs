//! RideLink - live cycling sensor ingestion and trainer control
//!
//! Connects to BLE fitness sensors, supervises their links, drives FTMS smart
//! trainers, and turns the incoming readings into real-time ride metrics.

pub mod clock;
pub mod events;
pub mod metrics;
pub mod recording;
pub mod sensors;
pub mod storage;

// Re-export commonly used types
pub use clock::{MonotonicClock, Timestamp};
pub use events::{EventBus, Subscription};
pub use recording::recorder::SessionRecorder;
pub use recording::profile::UserProfile;
pub use sensors::control::FtmsController;
pub use sensors::link::LinkSupervisor;
pub use sensors::manager::SensorManager;
