//! Rider profile consumed at session start.

use crate::metrics::calories::ActivityCategory;
use serde::{Deserialize, Serialize};

/// Where the activity takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// On a trainer; distance comes from the power model
    #[default]
    Indoor,
    /// On the road; distance comes from sensor or GPS speed
    Outdoor,
}

/// Rider profile. Every field is optional; missing values disable the
/// features that depend on them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    /// Functional Threshold Power in watts
    pub ftp_watts: Option<u16>,
    /// Threshold heart rate in BPM
    pub threshold_hr: Option<u8>,
    /// Rider weight in kilograms
    pub weight_kg: Option<f64>,
    /// Rider age in years
    pub age: Option<u32>,
    /// Kind of riding
    pub category: Option<ActivityCategory>,
    /// Indoor or outdoor
    pub environment: Environment,
}

impl UserProfile {
    pub fn is_indoor(&self) -> bool {
        self.environment == Environment::Indoor
    }
}

/// Read-only access to the rider profile.
pub trait ProfileSource: Send + Sync {
    /// Current profile snapshot.
    fn profile(&self) -> UserProfile;
}

impl ProfileSource for UserProfile {
    fn profile(&self) -> UserProfile {
        self.clone()
    }
}
