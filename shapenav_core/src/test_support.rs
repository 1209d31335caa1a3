//! Shared fixtures for unit tests: equator-anchored meter grids.

use shapenav_env::{GeoPoint, Instruction, ManeuverKind, PlannedManeuver};

use crate::shapenav_geometry::EARTH_RADIUS_M;

/// Meters per degree of arc on the haversine sphere.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Point `x_m` east and `y_m` north of (0, 0).
pub fn grid(x_m: f64, y_m: f64) -> GeoPoint {
    GeoPoint::new(y_m / METERS_PER_DEGREE, x_m / METERS_PER_DEGREE)
}

/// Point on the equator `m` meters east of (0, 0).
pub fn meters_east(m: f64) -> GeoPoint {
    grid(m, 0.0)
}

/// Sawtooth polyline with `n` vertices spaced `step_m` apart eastward.
pub fn zigzag(n: usize, step_m: f64) -> Vec<GeoPoint> {
    (0..n)
        .map(|i| {
            let y = if i % 2 == 0 { 0.0 } else { step_m };
            grid(i as f64 * step_m, y)
        })
        .collect()
}

pub fn maneuver_at(position: GeoPoint, text: &str) -> PlannedManeuver {
    PlannedManeuver::at_position(position, Instruction::from_text(text))
}

pub fn start_and_arrive(start: GeoPoint, end: GeoPoint) -> Vec<PlannedManeuver> {
    vec![
        PlannedManeuver::at_position(start, Instruction::new(ManeuverKind::Start, "Depart")),
        PlannedManeuver::at_position(end, Instruction::new(ManeuverKind::Arrive, "Arrive")),
    ]
}
