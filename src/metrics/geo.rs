//! Great-circle distance and GPS-derived speed.

use crate::clock::Timestamp;
use crate::recording::types::GeoPoint;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Segments implying more than this are treated as GPS jumps.
pub const MAX_SEGMENT_SPEED_MS: f64 = 20.0;

/// Haversine distance between two points, in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Speed in m/s over a run of timestamped positions.
///
/// Sums consecutive segments, skipping any that imply a jump above
/// [`MAX_SEGMENT_SPEED_MS`] or have no elapsed time. Returns `None` when no
/// usable segment remains.
pub fn gps_speed_ms(track: &[(Timestamp, GeoPoint)]) -> Option<f64> {
    let mut distance = 0.0;
    let mut seconds = 0.0;

    for pair in track.windows(2) {
        let (t0, p0) = pair[0];
        let (t1, p1) = pair[1];
        let dt = t1.saturating_sub(t0) as f64 / 1000.0;
        if dt <= 0.0 {
            continue;
        }

        let d = haversine_m(p0, p1);
        if d / dt > MAX_SEGMENT_SPEED_MS {
            tracing::debug!("Rejecting GPS segment: {:.1}m in {:.1}s", d, dt);
            continue;
        }

        distance += d;
        seconds += dt;
    }

    (seconds > 0.0).then(|| distance / seconds)
}
