//! Geofence evaluation: great-circle distance and circular-zone containment.
//!
//! Haversine on a spherical earth. Pure and total: NaN coordinates yield a NaN distance
//! and a `false` containment, never a panic.

use crate::shared::{AlertZone, Point};

/// Mean earth radius used by the spherical approximation.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters.
pub fn distance(a: Point, b: Point) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1]; clamp keeps NaN as NaN.
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

/// True iff `point` lies within the zone, boundary inclusive.
pub fn contains(zone: &AlertZone, point: Point) -> bool {
    distance(zone.center, point) <= zone.radius_meters
}
