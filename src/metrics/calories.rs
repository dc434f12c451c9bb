//! Calorie estimation waterfall.
//!
//! Tiers are tried in priority order and the first one whose inputs are all
//! present wins outright. Results from different tiers are never blended.

use serde::{Deserialize, Serialize};

/// kcal per kJ of mechanical work at ~25% gross efficiency.
const KCAL_PER_KJ: f64 = 0.239;

/// Threshold HR assumed when the profile has none.
pub const DEFAULT_THRESHOLD_HR: f64 = 170.0;
/// Body weight assumed when the profile has none.
pub const DEFAULT_WEIGHT_KG: f64 = 75.0;
/// Age assumed when the profile has none.
pub const DEFAULT_AGE: u32 = 35;
/// MET used when nothing but elapsed time is known.
pub const MODERATE_MET: f64 = 6.0;

/// Kind of riding, used by the MET and per-km tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    #[default]
    Road,
    Mountain,
    Gravel,
    Indoor,
    Commute,
}

impl ActivityCategory {
    /// MET for a steady effort in this category.
    pub fn met(&self) -> f64 {
        match self {
            ActivityCategory::Road => 8.0,
            ActivityCategory::Mountain => 8.5,
            ActivityCategory::Gravel => 8.3,
            ActivityCategory::Indoor => 7.0,
            ActivityCategory::Commute => 6.0,
        }
    }

    /// MET when only the category and duration are known.
    pub fn fallback_met(&self) -> f64 {
        match self {
            ActivityCategory::Road => 7.5,
            ActivityCategory::Mountain => 8.0,
            ActivityCategory::Gravel => 7.8,
            ActivityCategory::Indoor => 6.8,
            ActivityCategory::Commute => 5.5,
        }
    }

    /// kcal per kg of body weight per km.
    pub fn kcal_per_kg_km(&self) -> f64 {
        match self {
            ActivityCategory::Road => 0.28,
            ActivityCategory::Mountain => 0.40,
            ActivityCategory::Gravel => 0.33,
            ActivityCategory::Indoor => 0.26,
            ActivityCategory::Commute => 0.30,
        }
    }
}

/// Which tier produced an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalorieMethod {
    /// Mechanical work scaled by HR intensity
    PowerAndHeartRate,
    /// Mechanical work only
    Power,
    /// Category MET scaled by HR intensity bucket
    HeartRateAndCategory,
    /// HR regression (Keytel/ACSM style)
    HeartRate,
    /// Per-km constant for the category
    DistanceAndCategory,
    /// Category fallback MET over elapsed time
    Category,
    /// Fixed moderate MET over elapsed time
    ElapsedTime,
}

/// Inputs available to the waterfall.
#[derive(Debug, Clone, Default)]
pub struct CalorieInputs {
    /// Average power over the session (W)
    pub avg_power: Option<f64>,
    /// Average heart rate over the session (bpm)
    pub avg_hr: Option<f64>,
    /// Threshold heart rate from the profile
    pub threshold_hr: Option<f64>,
    /// Rider weight (kg)
    pub weight_kg: Option<f64>,
    /// Rider age (years)
    pub age: Option<u32>,
    /// Activity category
    pub category: Option<ActivityCategory>,
    /// Distance covered (m)
    pub distance_m: f64,
    /// Active time (s)
    pub moving_secs: f64,
}

/// Result of the waterfall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalorieEstimate {
    pub kcal: f64,
    pub method: CalorieMethod,
}

/// HR efficiency factor applied on top of mechanical work.
pub fn hr_efficiency_factor(hr: f64, threshold_hr: f64) -> f64 {
    (0.85 + (hr / threshold_hr - 0.6) * 0.75).clamp(0.85, 1.15)
}

/// Intensity multiplier for a fraction of threshold HR.
pub fn intensity_multiplier(hr_fraction: f64) -> f64 {
    if hr_fraction < 0.6 {
        0.6
    } else if hr_fraction < 0.75 {
        0.8
    } else if hr_fraction < 0.85 {
        1.0
    } else if hr_fraction < 0.95 {
        1.2
    } else {
        1.4
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

/// Run the waterfall.
pub fn estimate(inputs: &CalorieInputs) -> CalorieEstimate {
    let hours = inputs.moving_secs / 3600.0;
    let weight = positive(inputs.weight_kg).unwrap_or(DEFAULT_WEIGHT_KG);
    let threshold = positive(inputs.threshold_hr).unwrap_or(DEFAULT_THRESHOLD_HR);
    let power = positive(inputs.avg_power);
    let hr = positive(inputs.avg_hr);

    let (kcal, method) = if let (Some(power), Some(hr)) = (power, hr) {
        let kj = power * inputs.moving_secs / 1000.0;
        (
            kj * KCAL_PER_KJ * hr_efficiency_factor(hr, threshold),
            CalorieMethod::PowerAndHeartRate,
        )
    } else if let Some(power) = power {
        let kj = power * inputs.moving_secs / 1000.0;
        (kj * KCAL_PER_KJ, CalorieMethod::Power)
    } else if let (Some(hr), Some(category)) = (hr, inputs.category) {
        let met = category.met() * intensity_multiplier(hr / threshold);
        (met * weight * hours, CalorieMethod::HeartRateAndCategory)
    } else if let Some(hr) = hr {
        let age = inputs.age.unwrap_or(DEFAULT_AGE) as f64;
        let per_minute = (-55.0969 + 0.6309 * hr + 0.1988 * weight + 0.2017 * age) / 4.184;
        (
            (per_minute * inputs.moving_secs / 60.0).max(0.0),
            CalorieMethod::HeartRate,
        )
    } else if let Some(category) = inputs.category.filter(|_| inputs.distance_m > 0.0) {
        (
            category.kcal_per_kg_km() * weight * inputs.distance_m / 1000.0,
            CalorieMethod::DistanceAndCategory,
        )
    } else if let Some(category) = inputs.category {
        (category.fallback_met() * weight * hours, CalorieMethod::Category)
    } else {
        (MODERATE_MET * weight * hours, CalorieMethod::ElapsedTime)
    };

    CalorieEstimate { kcal, method }
}
