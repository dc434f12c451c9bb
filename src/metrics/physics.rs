//! Power-to-speed model for virtual distance.
//!
//! Flat-road model: rolling resistance plus aerodynamic drag. Velocity is found
//! by a linear search over 0..=20 m/s in 0.1 m/s steps, picking the velocity
//! whose required power is closest to the target.

/// Physics constants
const AIR_DENSITY: f64 = 1.225; // kg/m³ at sea level
const GRAVITY: f64 = 9.81; // m/s²
const DEFAULT_CDA: f64 = 0.32; // m² (hoods position)
const DEFAULT_CRR: f64 = 0.004; // Rolling resistance for road tires
const BIKE_MASS: f64 = 8.0; // kg

/// Default rider mass when the profile has none.
pub const DEFAULT_RIDER_MASS_KG: f64 = 75.0;

/// Search ceiling in m/s.
const MAX_SEARCH_VELOCITY: f64 = 20.0;
/// Search step in m/s.
const SEARCH_STEP: f64 = 0.1;

/// Flat-road physics model.
#[derive(Debug, Clone)]
pub struct PhysicsModel {
    /// Rider mass in kilograms
    pub rider_mass_kg: f64,
    /// Bike mass in kilograms
    pub bike_mass_kg: f64,
    /// Drag coefficient times frontal area (CdA)
    pub cda: f64,
    /// Rolling resistance coefficient
    pub crr: f64,
}

impl Default for PhysicsModel {
    fn default() -> Self {
        Self {
            rider_mass_kg: DEFAULT_RIDER_MASS_KG,
            bike_mass_kg: BIKE_MASS,
            cda: DEFAULT_CDA,
            crr: DEFAULT_CRR,
        }
    }
}

impl PhysicsModel {
    /// Create a model for the given rider mass.
    pub fn new(rider_mass_kg: f64) -> Self {
        Self {
            rider_mass_kg,
            ..Default::default()
        }
    }

    /// Total system mass (rider + bike)
    fn total_mass(&self) -> f64 {
        self.rider_mass_kg + self.bike_mass_kg
    }

    /// Power needed to overcome rolling resistance at `v` m/s.
    pub fn rolling_resistance_power(&self, v: f64) -> f64 {
        self.crr * self.total_mass() * GRAVITY * v
    }

    /// Power needed to overcome air resistance at `v` m/s.
    pub fn air_resistance_power(&self, v: f64) -> f64 {
        0.5 * AIR_DENSITY * self.cda * v * v * v
    }

    /// Total power needed to hold `v` m/s on the flat.
    pub fn power_at(&self, v: f64) -> f64 {
        self.rolling_resistance_power(v) + self.air_resistance_power(v)
    }

    /// Velocity in m/s sustained by `power_watts`.
    pub fn solve_velocity(&self, power_watts: f64) -> f64 {
        if power_watts <= 0.0 {
            return 0.0;
        }

        let steps = (MAX_SEARCH_VELOCITY / SEARCH_STEP).round() as u32;
        let mut best_v = 0.0;
        let mut best_err = f64::INFINITY;

        for i in 0..=steps {
            let v = i as f64 * SEARCH_STEP;
            let err = (self.power_at(v) - power_watts).abs();
            if err < best_err {
                best_err = err;
                best_v = v;
            }
        }

        best_v
    }
}
