//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of one simulated vehicle:
//! - The path it actually drives (which may leave the published route)
//! - Kinematics (constant speed along the path, then dwell at the end)
//! - GPS fix generation (Gaussian noise, multipath outliers, corrupt fixes)
//!
//! Paths are built in a local east/north meter frame and converted to
//! WGS84 through a [`LocalFrame`].

use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use shapenav_core::shapenav_geometry::EARTH_RADIUS_M;
use shapenav_core::Fix;
use shapenav_env::GeoPoint;

/// Equirectangular mapping between local meters and WGS84 around an origin.
#[derive(Debug, Clone, Copy)]
pub struct LocalFrame {
    origin: GeoPoint,
    meters_per_deg_lat: f64,
    meters_per_deg_lon: f64,
}

impl LocalFrame {
    pub fn new(origin: GeoPoint) -> Self {
        let meters_per_deg_lat = EARTH_RADIUS_M.to_radians();
        Self {
            origin,
            meters_per_deg_lat,
            meters_per_deg_lon: meters_per_deg_lat * origin.lat.to_radians().cos(),
        }
    }

    pub fn to_geo(&self, p: &Vector2<f64>) -> GeoPoint {
        GeoPoint::new(
            self.origin.lat + p.y / self.meters_per_deg_lat,
            self.origin.lon + p.x / self.meters_per_deg_lon,
        )
    }

    pub fn to_local(&self, g: &GeoPoint) -> Vector2<f64> {
        Vector2::new(
            (g.lon - self.origin.lon) * self.meters_per_deg_lon,
            (g.lat - self.origin.lat) * self.meters_per_deg_lat,
        )
    }

    pub fn path_to_geo(&self, path: &[Vector2<f64>]) -> Vec<GeoPoint> {
        path.iter().map(|p| self.to_geo(p)).collect()
    }
}

impl Default for LocalFrame {
    /// Amsterdam Centraal.
    fn default() -> Self {
        Self::new(GeoPoint::new(52.3791, 4.9003))
    }
}

// ============================================================================
// PATH BUILDERS
// ============================================================================

/// Vertices closer than this to a detour junction are dropped (meters).
const PATH_EPSILON_M: f64 = 1e-6;

/// Samples the segment `a -> b` every `step_m`, excluding `a`, including `b`.
fn sample_leg(a: Vector2<f64>, b: Vector2<f64>, step_m: f64) -> Vec<Vector2<f64>> {
    let len = (b - a).norm();
    let n = (len / step_m.max(1.0)).ceil().max(1.0) as usize;
    (1..=n).map(|i| a + (b - a) * (i as f64 / n as f64)).collect()
}

/// Polyline through `corners`, sampled every `step_m`.
pub fn polyline(corners: &[Vector2<f64>], step_m: f64) -> Vec<Vector2<f64>> {
    let Some(first) = corners.first() else {
        return Vec::new();
    };
    let mut path = vec![*first];
    for w in corners.windows(2) {
        path.extend(sample_leg(w[0], w[1], step_m));
    }
    path
}

/// East for `east_m`, then north for `north_m`.
pub fn l_route(east_m: f64, north_m: f64, step_m: f64) -> Vec<Vector2<f64>> {
    polyline(
        &[
            Vector2::new(0.0, 0.0),
            Vector2::new(east_m, 0.0),
            Vector2::new(east_m, north_m),
        ],
        step_m,
    )
}

/// A detour leaving `route` at `from_m` and rejoining it at `to_m`.
#[derive(Debug, Clone)]
pub struct Detour {
    /// What the vehicle actually drives
    pub driven: Vec<Vector2<f64>>,

    /// The side street: parallel section plus the rejoin point on the route
    pub street: Vec<Vector2<f64>>,
}

/// Builds a parallel side street `offset_m` to the left of `route` between
/// `from_m` and `to_m` (which must lie on one straight leg).
pub fn with_detour(route: &[Vector2<f64>], from_m: f64, to_m: f64, offset_m: f64, step_m: f64) -> Detour {
    let cumulative = cumulative(route);
    let (leave, dir) = point_along(route, &cumulative, from_m);
    let (rejoin, _) = point_along(route, &cumulative, to_m);
    let normal = Vector2::new(-dir.y, dir.x);

    let ramp_m = (to_m - from_m) * 0.05;
    let street_start = leave + dir * ramp_m + normal * offset_m;
    let street_end = rejoin - dir * ramp_m + normal * offset_m;

    let mut street = vec![street_start];
    street.extend(sample_leg(street_start, street_end, step_m));
    street.push(rejoin);

    let mut driven: Vec<Vector2<f64>> = route
        .iter()
        .zip(&cumulative)
        .take_while(|(_, d)| **d < from_m - PATH_EPSILON_M)
        .map(|(p, _)| *p)
        .collect();
    driven.push(leave);
    driven.extend_from_slice(&street);
    driven.extend(
        route
            .iter()
            .zip(&cumulative)
            .skip_while(|(_, d)| **d <= to_m + PATH_EPSILON_M)
            .map(|(p, _)| *p),
    );

    Detour { driven, street }
}

fn cumulative(path: &[Vector2<f64>]) -> Vec<f64> {
    let mut out = Vec::with_capacity(path.len());
    let mut total = 0.0;
    for (i, p) in path.iter().enumerate() {
        if i > 0 {
            total += (p - path[i - 1]).norm();
        }
        out.push(total);
    }
    out
}

/// Position and unit direction at `distance_m` along `path`.
fn point_along(path: &[Vector2<f64>], cumulative: &[f64], distance_m: f64) -> (Vector2<f64>, Vector2<f64>) {
    if path.len() < 2 {
        let p = path.first().copied().unwrap_or_else(Vector2::zeros);
        return (p, Vector2::new(1.0, 0.0));
    }
    let last = path.len() - 2;
    let i = cumulative[1..].partition_point(|&c| c < distance_m).min(last);
    let seg = path[i + 1] - path[i];
    let len = seg.norm();
    if len <= f64::EPSILON {
        return (path[i], Vector2::new(1.0, 0.0));
    }
    let t = ((distance_m - cumulative[i]) / len).clamp(0.0, 1.0);
    (path[i] + seg * t, seg / len)
}

// ============================================================================
// ORACLE
// ============================================================================

/// Ground truth for one vehicle plus its (imperfect) GPS receiver.
pub struct Oracle {
    /// Physics seed (separate from the context seed)
    physics_seed: u64,

    physics_rng: ChaCha8Rng,
    frame: LocalFrame,

    path: Vec<Vector2<f64>>,
    cumulative: Vec<f64>,

    /// Distance driven along `path` (meters)
    traveled_m: f64,
    speed_mps: f64,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Per-axis position noise standard deviation (meters)
    position_noise_std: f64,

    /// Accuracy the receiver reports (meters)
    reported_accuracy_m: f64,

    heading_noise_std_deg: f64,

    /// Probability and size of a multipath jump
    outlier_rate: f64,
    outlier_m: f64,

    /// Probability of a corrupt (NaN) fix
    invalid_rate: f64,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_seed,
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            frame: LocalFrame::default(),
            path: Vec::new(),
            cumulative: Vec::new(),
            traveled_m: 0.0,
            speed_mps: 10.0,
            current_time: 0.0,
            position_noise_std: 3.0,
            reported_accuracy_m: 5.0,
            heading_noise_std_deg: 5.0,
            outlier_rate: 0.0,
            outlier_m: 0.0,
            invalid_rate: 0.0,
        }
    }

    pub fn physics_seed(&self) -> u64 {
        self.physics_seed
    }

    pub fn frame(&self) -> &LocalFrame {
        &self.frame
    }

    /// Replaces the driven path and restarts at its beginning.
    pub fn drive(&mut self, path: Vec<Vector2<f64>>) {
        self.cumulative = cumulative(&path);
        self.path = path;
        self.traveled_m = 0.0;
    }

    pub fn set_speed(&mut self, speed_mps: f64) {
        self.speed_mps = speed_mps;
    }

    /// Sets the position noise and the accuracy the receiver claims.
    pub fn set_position_noise(&mut self, std_dev: f64, reported_accuracy_m: f64) {
        self.position_noise_std = std_dev;
        self.reported_accuracy_m = reported_accuracy_m;
    }

    pub fn set_outliers(&mut self, rate: f64, jump_m: f64) {
        self.outlier_rate = rate.clamp(0.0, 1.0);
        self.outlier_m = jump_m;
    }

    pub fn set_invalid_rate(&mut self, rate: f64) {
        self.invalid_rate = rate.clamp(0.0, 1.0);
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        let total = self.cumulative.last().copied().unwrap_or(0.0);
        self.traveled_m = (self.traveled_m + self.speed_mps * dt).min(total);
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn time_ms(&self) -> u64 {
        (self.current_time * 1_000.0).round() as u64
    }

    pub fn traveled_m(&self) -> f64 {
        self.traveled_m
    }

    /// True once the vehicle has reached the end of its path.
    pub fn finished(&self) -> bool {
        self.cumulative
            .last()
            .map_or(true, |total| self.traveled_m >= *total)
    }

    /// True position in the local frame.
    pub fn position(&self) -> Vector2<f64> {
        point_along(&self.path, &self.cumulative, self.traveled_m).0
    }

    pub fn true_position(&self) -> GeoPoint {
        self.frame.to_geo(&self.position())
    }

    /// Direction of travel, degrees clockwise from north.
    pub fn heading_deg(&self) -> f64 {
        let (_, dir) = point_along(&self.path, &self.cumulative, self.traveled_m);
        dir.x.atan2(dir.y).to_degrees().rem_euclid(360.0)
    }

    /// Generates a noisy fix stamped with the current time.
    pub fn generate_fix(&mut self) -> Fix {
        let timestamp_ms = self.time_ms();
        if self.invalid_rate > 0.0 && self.physics_rng.gen_bool(self.invalid_rate) {
            return Fix::new(GeoPoint::new(f64::NAN, f64::NAN), self.reported_accuracy_m, timestamp_ms);
        }

        let mut position = self.position();
        if self.position_noise_std > 0.0 {
            if let Ok(normal) = Normal::new(0.0, self.position_noise_std) {
                position += Vector2::new(
                    normal.sample(&mut self.physics_rng),
                    normal.sample(&mut self.physics_rng),
                );
            }
        }
        if self.outlier_rate > 0.0 && self.physics_rng.gen_bool(self.outlier_rate) {
            let angle = self.physics_rng.gen_range(0.0..std::f64::consts::TAU);
            position += Vector2::new(angle.cos(), angle.sin()) * self.outlier_m;
        }

        let mut heading = self.heading_deg();
        if self.heading_noise_std_deg > 0.0 {
            if let Ok(normal) = Normal::new(0.0, self.heading_noise_std_deg) {
                heading += normal.sample(&mut self.physics_rng);
            }
        }

        Fix::new(self.frame.to_geo(&position), self.reported_accuracy_m, timestamp_ms)
            .with_heading(heading.rem_euclid(360.0))
    }
}

// ============================================================================
// DELIVERY FAULTS
// ============================================================================

/// Fix transport that reorders and duplicates deliveries (seeded).
pub struct FaultyTransport {
    rng: ChaCha8Rng,
    reorder_rate: f64,
    duplicate_rate: f64,

    /// A fix held back to be delivered after its successor
    held: Option<Fix>,
}

impl FaultyTransport {
    pub fn new(seed: u64, reorder_rate: f64, duplicate_rate: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            reorder_rate: reorder_rate.clamp(0.0, 1.0),
            duplicate_rate: duplicate_rate.clamp(0.0, 1.0),
            held: None,
        }
    }

    /// Hands a fix to the transport; returns what arrives now, in order.
    pub fn deliver(&mut self, fix: Fix) -> Vec<Fix> {
        if self.held.is_none() && self.rng.gen_bool(self.reorder_rate) {
            self.held = Some(fix);
            return Vec::new();
        }

        let mut out = vec![fix];
        if let Some(late) = self.held.take() {
            out.push(late);
        }
        if self.rng.gen_bool(self.duplicate_rate) {
            out.push(fix);
        }
        out
    }

    /// Releases anything still held back.
    pub fn flush(&mut self) -> Vec<Fix> {
        self.held.take().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shapenav_core::shapenav_geometry::haversine_m;

    #[test]
    fn test_frame_round_trip_distance() {
        let frame = LocalFrame::default();
        let a = frame.to_geo(&Vector2::new(0.0, 0.0));
        let b = frame.to_geo(&Vector2::new(300.0, 400.0));
        assert_relative_eq!(haversine_m(&a, &b), 500.0, epsilon = 0.5);
        let back = frame.to_local(&b);
        assert_relative_eq!(back.x, 300.0, epsilon = 1e-6);
        assert_relative_eq!(back.y, 400.0, epsilon = 1e-6);
    }

    #[test]
    fn test_l_route_shape() {
        let path = l_route(100.0, 50.0, 25.0);
        assert_eq!(path.len(), 7);
        assert_eq!(path[4], Vector2::new(100.0, 0.0));
        assert_eq!(path[6], Vector2::new(100.0, 50.0));
    }

    #[test]
    fn test_oracle_drives_and_dwells() {
        let mut oracle = Oracle::new(42);
        oracle.drive(l_route(100.0, 100.0, 10.0));
        oracle.set_speed(20.0);

        oracle.step(4.5);
        assert_relative_eq!(oracle.position().x, 90.0, epsilon = 1e-9);
        assert_relative_eq!(oracle.heading_deg(), 90.0, epsilon = 1e-9);
        assert!(!oracle.finished());

        oracle.step(5.0);
        oracle.step(5.5);
        assert!(oracle.finished());
        assert_relative_eq!(oracle.position().x, 100.0, epsilon = 1e-9);
        assert_relative_eq!(oracle.position().y, 100.0, epsilon = 1e-9);
        assert_eq!(oracle.time_ms(), 15_000);
    }

    #[test]
    fn test_oracle_deterministic_noise() {
        let mut oracle1 = Oracle::new(42);
        let mut oracle2 = Oracle::new(42);
        oracle1.drive(l_route(100.0, 0.0, 10.0));
        oracle2.drive(l_route(100.0, 0.0, 10.0));

        // Same seed = same noise
        assert_eq!(oracle1.generate_fix(), oracle2.generate_fix());
    }

    #[test]
    fn test_invalid_fixes_are_generated() {
        let mut oracle = Oracle::new(7);
        oracle.drive(l_route(100.0, 0.0, 10.0));
        oracle.set_invalid_rate(1.0);
        assert!(oracle.generate_fix().validate().is_err());
    }

    #[test]
    fn test_detour_leaves_and_rejoins() {
        let route = polyline(&[Vector2::new(0.0, 0.0), Vector2::new(1_000.0, 0.0)], 50.0);
        let detour = with_detour(&route, 200.0, 600.0, 100.0, 50.0);

        let rejoin = detour.street[detour.street.len() - 1];
        assert_relative_eq!(rejoin.x, 600.0, epsilon = 1e-6);
        assert_relative_eq!(rejoin.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(detour.street[0].y, 100.0, epsilon = 1e-9);
        assert!(detour.driven.iter().any(|p| p.y > 99.0));
        assert_eq!(detour.driven[0], Vector2::new(0.0, 0.0));
        assert_relative_eq!(detour.driven[detour.driven.len() - 1].x, 1_000.0, epsilon = 1e-6);
        // Never goes backwards along the road.
        assert!(detour.driven.windows(2).all(|w| w[1].x > w[0].x - 1e-6));
    }

    #[test]
    fn test_transport_reorders_and_duplicates() {
        let mut always = FaultyTransport::new(1, 1.0, 1.0);
        let a = Fix::new(GeoPoint::new(0.0, 0.0), 5.0, 1_000);
        let b = Fix::new(GeoPoint::new(0.0, 0.001), 5.0, 2_000);

        assert!(always.deliver(a).is_empty());
        assert_eq!(always.deliver(b), vec![b, a, b]);
        assert!(always.flush().is_empty());

        let mut never = FaultyTransport::new(1, 0.0, 0.0);
        assert_eq!(never.deliver(a), vec![a]);
    }
}
