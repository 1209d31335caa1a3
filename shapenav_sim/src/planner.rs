//! Scripted maneuver planner for simulation.
//!
//! `SimPlanner` stands in for the external routing service. It derives
//! maneuvers from bearing changes along the requested geometry, knows a set
//! of side streets it can route a deviated vehicle over, and supports
//! injected outages and latency through [`PlannerController`].

use async_trait::async_trait;
use shapenav_core::shapenav_geometry::{bearing_deg, haversine_m};
use shapenav_env::{
    EnvError, GeoPoint, Instruction, ManeuverKind, ManeuverPlanner, NavContext, PlanRequest,
    PlanResponse, PlannedManeuver, PlannerController,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::context::SimContext;

/// Bearing change (degrees) that counts as a turn.
const TURN_THRESHOLD_DEG: f64 = 30.0;

/// Bearing change (degrees) that counts as a U-turn.
const UTURN_THRESHOLD_DEG: f64 = 150.0;

/// Segments shorter than this are ignored for turn detection (meters).
const MIN_TURN_SEGMENT_M: f64 = 5.0;

#[derive(Debug, Default)]
struct Faults {
    fail_remaining: u32,
    latency_ms: u64,
}

/// Planner with injectable faults, answering from geometry alone.
pub struct SimPlanner {
    faults: Mutex<Faults>,

    /// Side streets a deviated vehicle may be routed over
    streets: Mutex<Vec<Vec<GeoPoint>>>,

    /// Largest distance from a request origin to a street vertex (meters)
    snap_radius_m: f64,

    calls: AtomicU32,
    failures: AtomicU32,

    /// Clock used for simulated latency in async calls
    clock: Option<Arc<SimContext>>,
}

impl SimPlanner {
    pub fn new() -> Self {
        Self {
            faults: Mutex::new(Faults::default()),
            streets: Mutex::new(Vec::new()),
            snap_radius_m: 150.0,
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            clock: None,
        }
    }

    /// Latency is slept on `clock` instead of being ignored.
    pub fn with_clock(mut self, clock: Arc<SimContext>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_snap_radius(mut self, snap_radius_m: f64) -> Self {
        self.snap_radius_m = snap_radius_m;
        self
    }

    /// Registers a side street. Its last point must lie on the main route.
    pub fn add_street(&self, street: Vec<GeoPoint>) {
        self.streets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(street);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn latency_ms(&self) -> u64 {
        self.faults().latency_ms
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers a request immediately, applying injected failures.
    ///
    /// Synchronous drivers call this directly and deliver the result after
    /// [`latency_ms`](Self::latency_ms) themselves.
    pub fn respond(&self, request: &PlanRequest) -> Result<PlanResponse, EnvError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults();
            if faults.fail_remaining > 0 {
                faults.fail_remaining -= 1;
                self.failures.fetch_add(1, Ordering::SeqCst);
                debug!("Planner outage for {} ({} left)", request.shape_id, faults.fail_remaining);
                return Err(EnvError::network("planner unreachable (injected outage)"));
            }
        }

        if request.points.len() < 2 {
            return Err(EnvError::rejected("need at least two points"));
        }

        let geometry = self.route_over_streets(&request.points);
        let points = if geometry.is_empty() { &request.points } else { &geometry };
        Ok(PlanResponse {
            maneuvers: derive_maneuvers(points),
            total_distance_m: Some(path_length_m(points)),
            geometry,
        })
    }

    /// Street-based geometry when the request starts near a known street:
    /// the street from its closest vertex, then the request points after
    /// the street's end. Empty when no street is in reach.
    fn route_over_streets(&self, points: &[GeoPoint]) -> Vec<GeoPoint> {
        let origin = points[0];
        let streets = self.streets.lock().unwrap_or_else(PoisonError::into_inner);

        let best = streets
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|street| {
                let (vertex, dist) = nearest(street, &origin)?;
                (dist <= self.snap_radius_m).then_some((street, vertex, dist))
            })
            .min_by(|a, b| a.2.total_cmp(&b.2));

        let Some((street, vertex, _)) = best else {
            return Vec::new();
        };
        let Some(rejoin) = street.last() else {
            return Vec::new();
        };
        let Some((after, _)) = nearest(&points[1..], rejoin) else {
            return Vec::new();
        };

        let mut geometry = street[vertex..].to_vec();
        geometry.extend_from_slice(&points[after + 2..]);
        geometry
    }
}

impl Default for SimPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManeuverPlanner for SimPlanner {
    async fn plan(&self, request: PlanRequest) -> Result<PlanResponse, EnvError> {
        let latency_ms = self.latency_ms();
        if latency_ms > 0 {
            if let Some(clock) = &self.clock {
                clock.sleep(Duration::from_millis(latency_ms)).await;
            }
        }
        self.respond(&request)
    }

    fn name(&self) -> &str {
        "sim-planner"
    }
}

impl PlannerController for SimPlanner {
    fn fail_next(&self, count: u32) {
        self.faults().fail_remaining = count;
    }

    fn set_latency_ms(&self, latency_ms: u64) {
        self.faults().latency_ms = latency_ms;
    }

    fn heal(&self) {
        *self.faults() = Faults::default();
    }
}

// ============================================================================
// MANEUVER DERIVATION
// ============================================================================

/// Start, one maneuver per significant bearing change, arrive.
///
/// Maneuvers reference `points` by index.
pub fn derive_maneuvers(points: &[GeoPoint]) -> Vec<PlannedManeuver> {
    let mut maneuvers = vec![PlannedManeuver::at_shape_index(
        0,
        Instruction::new(ManeuverKind::Start, "Depart"),
    )];

    for i in 1..points.len().saturating_sub(1) {
        let (prev, here, next) = (&points[i - 1], &points[i], &points[i + 1]);
        if haversine_m(prev, here) < MIN_TURN_SEGMENT_M || haversine_m(here, next) < MIN_TURN_SEGMENT_M {
            continue;
        }
        let turn = signed_turn_deg(bearing_deg(prev, here), bearing_deg(here, next));
        let instruction = if turn.abs() > UTURN_THRESHOLD_DEG {
            Instruction::new(ManeuverKind::Uturn, "Make a U-turn")
        } else if turn > TURN_THRESHOLD_DEG {
            Instruction::new(ManeuverKind::Right, "Turn right")
        } else if turn < -TURN_THRESHOLD_DEG {
            Instruction::new(ManeuverKind::Left, "Turn left")
        } else {
            continue;
        };
        maneuvers.push(PlannedManeuver::at_shape_index(i, instruction));
    }

    if points.len() > 1 {
        maneuvers.push(PlannedManeuver::at_shape_index(
            points.len() - 1,
            Instruction::new(ManeuverKind::Arrive, "You have arrived"),
        ));
    }
    maneuvers
}

/// Clockwise change from `from` to `to`, in [-180, 180).
fn signed_turn_deg(from: f64, to: f64) -> f64 {
    (to - from + 540.0).rem_euclid(360.0) - 180.0
}

fn path_length_m(points: &[GeoPoint]) -> f64 {
    points.windows(2).map(|w| haversine_m(&w[0], &w[1])).sum()
}

fn nearest(points: &[GeoPoint], target: &GeoPoint) -> Option<(usize, f64)> {
    points
        .iter()
        .enumerate()
        .map(|(i, p)| (i, haversine_m(p, target)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shapenav_env::ShapeId;

    const DEG: f64 = 1.0 / 111_195.0;

    fn east(m: f64) -> GeoPoint {
        GeoPoint::new(0.0, m * DEG)
    }

    fn at(x: f64, y: f64) -> GeoPoint {
        GeoPoint::new(y * DEG, x * DEG)
    }

    fn request(points: Vec<GeoPoint>) -> PlanRequest {
        PlanRequest {
            shape_id: ShapeId::from("s"),
            points,
            costing: "bus".to_string(),
        }
    }

    #[test]
    fn test_turns_are_classified() {
        // East, then north (left), then east again (right), then back west.
        let pts = [at(0.0, 0.0), at(100.0, 0.0), at(100.0, 100.0), at(200.0, 100.0), at(100.0, 100.5)];
        let kinds: Vec<ManeuverKind> = derive_maneuvers(&pts).iter().map(|m| m.instruction.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ManeuverKind::Start,
                ManeuverKind::Left,
                ManeuverKind::Right,
                ManeuverKind::Uturn,
                ManeuverKind::Arrive
            ]
        );
    }

    #[test]
    fn test_straight_road_has_start_and_arrive_only() {
        let pts: Vec<GeoPoint> = (0..10).map(|i| east(i as f64 * 50.0)).collect();
        let maneuvers = derive_maneuvers(&pts);
        assert_eq!(maneuvers.len(), 2);
        assert_eq!(maneuvers[1].shape_index, Some(9));
    }

    #[test]
    fn test_injected_failures_then_recovery() {
        let planner = SimPlanner::new();
        planner.fail_next(2);
        let req = request(vec![east(0.0), east(100.0)]);

        assert!(planner.respond(&req).is_err());
        assert!(planner.respond(&req).is_err());
        let ok = planner.respond(&req).unwrap();
        assert!(ok.geometry.is_empty());
        assert_eq!(ok.maneuvers.len(), 2);
        assert_eq!(planner.calls(), 3);
        assert_eq!(planner.failures(), 2);
    }

    #[test]
    fn test_heal_clears_faults() {
        let planner = SimPlanner::new();
        planner.fail_next(5);
        planner.set_latency_ms(300);
        planner.heal();
        assert_eq!(planner.latency_ms(), 0);
        assert!(planner.respond(&request(vec![east(0.0), east(10.0)])).is_ok());
    }

    #[test]
    fn test_routes_over_nearby_street() {
        let planner = SimPlanner::new();
        // Street 100 m north of the road, rejoining it at x = 400.
        let street: Vec<GeoPoint> = (1..=6)
            .map(|i| at(i as f64 * 50.0, 100.0))
            .chain(std::iter::once(at(400.0, 0.0)))
            .collect();
        planner.add_street(street.clone());

        let mut points = vec![at(120.0, 90.0)];
        points.extend((2..=10).map(|i| east(i as f64 * 50.0)));
        let response = planner.respond(&request(points)).unwrap();

        assert_eq!(response.geometry[0], street[1]);
        assert_eq!(response.geometry[5], at(400.0, 0.0));
        assert_eq!(response.geometry[6], east(450.0));
        assert_eq!(response.geometry.last().copied(), Some(east(500.0)));
        assert!(response.maneuvers.iter().any(|m| m.instruction.kind == ManeuverKind::Right));
    }

    #[test]
    fn test_far_street_is_ignored() {
        let planner = SimPlanner::new().with_snap_radius(50.0);
        planner.add_street(vec![at(0.0, 500.0), at(100.0, 500.0), at(200.0, 0.0)]);
        let response = planner.respond(&request(vec![east(0.0), east(300.0)])).unwrap();
        assert!(response.geometry.is_empty());
    }

    #[tokio::test]
    async fn test_latency_follows_virtual_clock() {
        let ctx = SimContext::shared(3);
        let planner = Arc::new(SimPlanner::new().with_clock(ctx.clone()));
        planner.set_latency_ms(2_000);

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let p = planner.clone();
        tokio::spawn(async move {
            let _ = tx.send(p.plan(request(vec![east(0.0), east(50.0)])).await);
        });

        tokio::task::yield_now().await;
        ctx.advance_time(Duration::from_millis(1_999));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        ctx.advance_time(Duration::from_millis(1));
        assert!(rx.await.unwrap().is_ok());
    }

    proptest! {
        #[test]
        fn prop_maneuvers_bracketed_and_ordered(
            steps in proptest::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 1..40),
        ) {
            let mut pts = vec![at(0.0, 0.0)];
            let (mut x, mut y) = (0.0, 0.0);
            for (dx, dy) in steps {
                x += dx;
                y += dy;
                pts.push(at(x, y));
            }

            let maneuvers = derive_maneuvers(&pts);
            let indices: Vec<usize> = maneuvers.iter().filter_map(|m| m.shape_index).collect();
            prop_assert_eq!(indices.len(), maneuvers.len());
            prop_assert_eq!(maneuvers[0].instruction.kind, ManeuverKind::Start);
            prop_assert_eq!(maneuvers[maneuvers.len() - 1].instruction.kind, ManeuverKind::Arrive);
            prop_assert_eq!(indices[indices.len() - 1], pts.len() - 1);
            prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
