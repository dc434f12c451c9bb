//! Metrics module for training calculations and zones.

pub mod calculator;
pub mod calories;
pub mod geo;
pub mod physics;
pub mod validation;
pub mod zones;

pub use calculator::{LoadEstimate, MetricsCalculator};
pub use calories::{ActivityCategory, CalorieEstimate, CalorieInputs, CalorieMethod};
pub use physics::PhysicsModel;
pub use zones::{HRZones, PowerZones, ZoneTimer};
