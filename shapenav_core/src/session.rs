//! Per-vehicle navigation session (sans-IO).
//!
//! A `NavSession` is driven by three inputs, all applied strictly in order:
//! fixes, planner answers and clock polls. It never sleeps or talks to the
//! network itself; re-plan requests come back to the caller as
//! [`ReplanCommand`]s and their answers come in through [`NavSession::handle_plan`].
//!
//! Pipeline per fix:
//! validate → ordering check → Matcher → Progress Tracker → Deviation Monitor
//! → re-plan scheduler → snapshot + events.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shapenav_env::{EnvError, GeoPoint, Instruction, PlanRequest, PlanResponse, SessionId, ShapeId};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RuntimeConfig};
use crate::error::NavError;
use crate::route_registry::RouteShape;
use crate::shapenav_deviation::{DeviationMonitor, DeviationSignal, ReplanScheduler, ReplanState};
use crate::shapenav_geometry::downsample_by_distance;
use crate::shapenav_maneuvers::ManeuverConfig;
use crate::shapenav_matcher::{Fix, MatchQuality, MatchedPoint, Matcher};
use crate::shapenav_progress::{ProgressTracker, TrackerPhase};

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Snapshot handed to the state consumer. A new value per accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationState {
    pub session_id: SessionId,
    pub shape_id: ShapeId,

    /// Registry version of the shape the session started on; re-planned
    /// routes keep it, `replans` tells them apart
    pub route_version: u64,

    /// Planner replacements applied so far
    pub replans: u32,

    pub phase: TrackerPhase,

    /// Ordinal of the active maneuver
    pub active_maneuver: usize,

    pub next_maneuver: Option<usize>,
    pub next_instruction: Option<Instruction>,

    /// Meters from the cursor to the next maneuver's anchor
    pub distance_to_next_m: Option<f64>,

    pub distance_to_end_m: f64,

    /// Cursor / completion target, in [0, 1]
    pub progress_fraction: f64,

    pub deviated: bool,

    /// Monotonic progress (meters)
    pub cursor_m: f64,

    /// Along-route distance of the latest match (diagnostics)
    pub raw_distance_m: Option<f64>,
    pub lateral_offset_m: Option<f64>,
    pub quality: Option<MatchQuality>,
    pub matched_position: Option<GeoPoint>,

    pub last_fix_ms: Option<u64>,

    /// Increases by one with every produced snapshot
    pub sequence: u64,
}

/// Discrete transitions, delivered in production order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NavEvent {
    ManeuverAdvanced { from: usize, to: usize },
    DeviationStarted { mean_offset_m: f64 },
    DeviationEnded,
    RouteCompleted,
    ReplanRequested { request_id: u64, attempt: u32 },
    ReplanFailed { request_id: u64, reason: String },
    RouteReplaced { shape_id: ShapeId },
}

/// Planner request the caller must dispatch asynchronously.
#[derive(Debug, Clone)]
pub struct ReplanCommand {
    pub request_id: u64,
    pub attempt: u32,
    pub request: PlanRequest,
}

/// Result of one session input.
#[derive(Debug, Clone)]
pub struct SessionStep {
    pub state: NavigationState,
    pub events: Vec<NavEvent>,
    pub replan: Option<ReplanCommand>,
}

impl SessionStep {
    pub fn has_event(&self, pred: impl Fn(&NavEvent) -> bool) -> bool {
        self.events.iter().any(pred)
    }
}

/// Outstanding request and the geometry it was built from.
#[derive(Debug, Clone)]
struct PendingReplan {
    request_id: u64,
    request: PlanRequest,
}

// ============================================================================
// SESSION
// ============================================================================

pub struct NavSession {
    session_id: SessionId,

    /// Route pinned for the session's lifetime (or its re-planned successor)
    route: Arc<RouteShape>,
    replans: u32,

    matcher: Matcher,
    tracker: ProgressTracker,
    monitor: DeviationMonitor,
    scheduler: ReplanScheduler,
    maneuver_config: ManeuverConfig,
    runtime: RuntimeConfig,

    last_fix: Option<Fix>,
    last_match: Option<MatchedPoint>,
    pending: Option<PendingReplan>,

    state: NavigationState,
}

impl NavSession {
    pub fn new(session_id: SessionId, route: Arc<RouteShape>, config: &EngineConfig) -> Self {
        let tracker = ProgressTracker::new(config.progress.clone(), route.completion_target_m());
        let mut session = Self {
            session_id,
            route,
            replans: 0,
            matcher: Matcher::new(config.matcher.clone()),
            tracker,
            monitor: DeviationMonitor::new(config.deviation.clone()),
            scheduler: ReplanScheduler::new(config.replan.clone()),
            maneuver_config: config.maneuvers.clone(),
            runtime: config.runtime.clone(),
            last_fix: None,
            last_match: None,
            pending: None,
            state: placeholder_state(session_id),
        };
        session.state = session.build_state(0);
        session
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn route(&self) -> &Arc<RouteShape> {
        &self.route
    }

    pub fn phase(&self) -> TrackerPhase {
        self.tracker.phase()
    }

    /// The authoritative state (last produced snapshot).
    pub fn state(&self) -> &NavigationState {
        &self.state
    }

    pub fn replan_state(&self) -> ReplanState {
        self.scheduler.state()
    }

    // ========================================================================
    // INPUTS
    // ========================================================================

    /// Processes one fix.
    ///
    /// Errors leave the session untouched: `InvalidFix` for malformed
    /// fixes, `StaleFix` for fixes not newer than the last accepted one.
    pub fn handle_fix(&mut self, fix: &Fix, now: Duration) -> Result<SessionStep, NavError> {
        let fix = fix.validate().map_err(|e| {
            warn!("Session {} dropped fix at {}ms: {}", self.session_id, fix.timestamp_ms, e);
            e
        })?;

        if let Some(last) = &self.last_fix {
            if fix.is_duplicate_of(last) {
                return Ok(self.unchanged());
            }
            if fix.timestamp_ms <= last.timestamp_ms {
                debug!(
                    "Session {} stale fix {}ms <= {}ms",
                    self.session_id, fix.timestamp_ms, last.timestamp_ms
                );
                return Err(NavError::StaleFix {
                    timestamp_ms: fix.timestamp_ms,
                    last_accepted_ms: last.timestamp_ms,
                });
            }
        }

        if self.tracker.phase() == TrackerPhase::Completed {
            return Ok(self.unchanged());
        }

        let now_ms = millis(now);
        let matched = self.matcher.match_fix(self.route.geometry(), &fix);
        self.last_fix = Some(fix);
        self.last_match = Some(matched);

        let mut events = Vec::new();
        let update = self.tracker.observe(&matched, self.route.maneuvers());
        if update.started {
            debug!("Session {} started at {:.1}m", self.session_id, matched.cumulative_m);
            self.monitor.reset();
        }
        if let Some((from, to)) = update.advanced {
            events.push(NavEvent::ManeuverAdvanced { from, to });
        }

        if update.completed {
            info!("Session {} completed shape {}", self.session_id, self.route.shape_id());
            self.scheduler.end_episode();
            self.pending = None;
            events.push(NavEvent::RouteCompleted);
        } else if self.tracker.is_tracking() {
            match self.monitor.observe(&matched) {
                DeviationSignal::Deviated { mean_offset_m } => {
                    self.tracker.enter_deviation();
                    self.scheduler.begin_episode(now_ms);
                    info!(
                        "Session {} deviated (mean offset {:.0}m, episode {})",
                        self.session_id,
                        mean_offset_m,
                        self.scheduler.episodes()
                    );
                    events.push(NavEvent::DeviationStarted { mean_offset_m });
                }
                DeviationSignal::Recovered => {
                    self.tracker.recover();
                    self.scheduler.end_episode();
                    self.pending = None;
                    info!("Session {} back on route", self.session_id);
                    events.push(NavEvent::DeviationEnded);
                }
                DeviationSignal::None => {}
            }
        }

        let replan = self.poll_replan(now_ms, &mut events);
        Ok(self.step(events, replan))
    }

    /// Applies a planner answer. Answers for requests that are no longer
    /// outstanding are dropped and produce no step.
    pub fn handle_plan(
        &mut self,
        request_id: u64,
        result: Result<PlanResponse, EnvError>,
        now: Duration,
    ) -> Option<SessionStep> {
        if !self.scheduler.is_current(request_id) {
            debug!("Session {} discarding late plan {}", self.session_id, request_id);
            return None;
        }
        let pending = self.pending.take().filter(|p| p.request_id == request_id)?;
        let now_ms = millis(now);
        let mut events = Vec::new();

        let built = result
            .map_err(|e| NavError::PlannerUnavailable(e.to_string()))
            .and_then(|response| {
                let basis = if response.geometry.is_empty() {
                    &pending.request.points
                } else {
                    &response.geometry
                };
                RouteShape::build(
                    self.route.shape_id().clone(),
                    self.route.version(),
                    basis,
                    &response.maneuvers,
                    &self.maneuver_config,
                )
            });

        match built {
            Ok(route) => {
                self.scheduler.succeeded();
                self.route = Arc::new(route);
                self.replans += 1;
                self.tracker.reset(self.route.completion_target_m());
                self.monitor.reset();
                info!(
                    "Session {} switched to re-planned route ({:.0} m)",
                    self.session_id,
                    self.route.geometry().total_length()
                );
                events.push(NavEvent::RouteReplaced {
                    shape_id: self.route.shape_id().clone(),
                });
            }
            Err(e) => {
                warn!("Session {} re-plan {} failed: {}", self.session_id, request_id, e);
                self.scheduler.failed(now_ms);
                events.push(NavEvent::ReplanFailed {
                    request_id,
                    reason: e.to_string(),
                });
            }
        }

        let replan = self.poll_replan(now_ms, &mut events);
        Some(self.step(events, replan))
    }

    /// Clock tick: expires overdue requests and issues due retries.
    pub fn poll(&mut self, now: Duration) -> Option<SessionStep> {
        let mut events = Vec::new();
        let replan = self.poll_replan(millis(now), &mut events);
        if events.is_empty() && replan.is_none() {
            return None;
        }
        Some(self.step(events, replan))
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn poll_replan(&mut self, now_ms: u64, events: &mut Vec<NavEvent>) -> Option<ReplanCommand> {
        if let Some(request_id) = self.scheduler.expire(now_ms) {
            warn!("Session {} re-plan {} timed out", self.session_id, request_id);
            self.pending = None;
            events.push(NavEvent::ReplanFailed {
                request_id,
                reason: "timed out".to_string(),
            });
        }

        if self.tracker.phase() != TrackerPhase::Deviated {
            return None;
        }
        let ticket = self.scheduler.poll(now_ms)?;
        let request = self.build_request();
        self.pending = Some(PendingReplan {
            request_id: ticket.request_id,
            request: request.clone(),
        });
        events.push(NavEvent::ReplanRequested {
            request_id: ticket.request_id,
            attempt: ticket.attempt,
        });

        Some(ReplanCommand {
            request_id: ticket.request_id,
            attempt: ticket.attempt,
            request,
        })
    }

    /// Last raw position, then the route ahead of the cursor.
    fn build_request(&self) -> PlanRequest {
        let geometry = self.route.geometry();
        let mut points = Vec::new();
        if let Some(fix) = &self.last_fix {
            points.push(fix.position);
        }
        for p in geometry.remaining_points_from(self.tracker.cursor_m()) {
            if points.last().map_or(true, |last: &GeoPoint| !last.same_position(&p)) {
                points.push(p);
            }
        }
        PlanRequest {
            shape_id: self.route.shape_id().clone(),
            points: downsample_by_distance(&points, self.runtime.request_min_step_m),
            costing: self.runtime.costing.clone(),
        }
    }

    fn unchanged(&self) -> SessionStep {
        SessionStep {
            state: self.state.clone(),
            events: Vec::new(),
            replan: None,
        }
    }

    fn step(&mut self, events: Vec<NavEvent>, replan: Option<ReplanCommand>) -> SessionStep {
        self.state = self.build_state(self.state.sequence + 1);
        SessionStep {
            state: self.state.clone(),
            events,
            replan,
        }
    }

    fn build_state(&self, sequence: u64) -> NavigationState {
        let maneuvers = self.route.maneuvers();
        let phase = self.tracker.phase();
        let cursor_m = self.tracker.cursor_m();
        let target = self.route.completion_target_m();
        let active = self.tracker.active_ordinal();
        let next = maneuvers.next_after(active);

        let progress_fraction = if phase == TrackerPhase::Completed {
            1.0
        } else if target > 0.0 {
            (cursor_m / target).clamp(0.0, 1.0)
        } else {
            0.0
        };

        NavigationState {
            session_id: self.session_id,
            shape_id: self.route.shape_id().clone(),
            route_version: self.route.version(),
            replans: self.replans,
            phase,
            active_maneuver: active,
            next_maneuver: next.map(|m| m.ordinal),
            next_instruction: next.map(|m| m.instruction.clone()),
            distance_to_next_m: next.map(|m| (m.anchor_m - cursor_m).max(0.0)),
            distance_to_end_m: (target - cursor_m).max(0.0),
            progress_fraction,
            deviated: phase == TrackerPhase::Deviated,
            cursor_m,
            raw_distance_m: self.tracker.raw_m(),
            lateral_offset_m: self.last_match.map(|m| m.lateral_offset_m),
            quality: self.last_match.map(|m| m.quality),
            matched_position: self.last_match.map(|m| m.point),
            last_fix_ms: self.last_fix.map(|f| f.timestamp_ms),
            sequence,
        }
    }
}

impl std::fmt::Debug for NavSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavSession")
            .field("session_id", &self.session_id)
            .field("shape_id", self.route.shape_id())
            .field("phase", &self.tracker.phase())
            .field("cursor_m", &self.tracker.cursor_m())
            .finish()
    }
}

fn placeholder_state(session_id: SessionId) -> NavigationState {
    NavigationState {
        session_id,
        shape_id: ShapeId::new(""),
        route_version: 0,
        replans: 0,
        phase: TrackerPhase::NotStarted,
        active_maneuver: 0,
        next_maneuver: None,
        next_instruction: None,
        distance_to_next_m: None,
        distance_to_end_m: 0.0,
        progress_fraction: 0.0,
        deviated: false,
        cursor_m: 0.0,
        raw_distance_m: None,
        lateral_offset_m: None,
        quality: None,
        matched_position: None,
        last_fix_ms: None,
        sequence: 0,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapenav_deviation::ReplanPolicy;
    use crate::test_support::{grid, maneuver_at, meters_east, start_and_arrive};
    use approx::assert_relative_eq;
    use shapenav_env::PlannedManeuver;

    fn session_on(points: &[GeoPoint], planned: &[PlannedManeuver], config: &EngineConfig) -> NavSession {
        let route = RouteShape::build(ShapeId::from("shape-1"), 1, points, planned, &config.maneuvers).unwrap();
        NavSession::new(SessionId::from_seed(1), Arc::new(route), config)
    }

    /// 2 km straight road east along the equator.
    fn long_road(config: &EngineConfig) -> NavSession {
        let pts: Vec<GeoPoint> = (0..=20).map(|i| meters_east(i as f64 * 100.0)).collect();
        session_on(&pts, &start_and_arrive(pts[0], pts[20]), config)
    }

    fn at(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn count(steps: &[SessionStep], pred: impl Fn(&NavEvent) -> bool) -> usize {
        steps.iter().flat_map(|s| s.events.iter()).filter(|e| pred(e)).count()
    }

    /// Drives the session off route then back; returns the deviation step.
    fn deviate(session: &mut NavSession) -> SessionStep {
        session.handle_fix(&Fix::new(grid(100.0, 0.0), 5.0, 1_000), at(1_000)).unwrap();
        session.handle_fix(&Fix::new(grid(110.0, 0.0), 5.0, 2_000), at(2_000)).unwrap();
        let mut t = 3_000;
        loop {
            let step = session
                .handle_fix(&Fix::new(grid(120.0 + t as f64 / 100.0, 200.0), 5.0, t), at(t))
                .unwrap();
            if step.has_event(|e| matches!(e, NavEvent::DeviationStarted { .. })) {
                return step;
            }
            t += 1_000;
        }
    }

    #[test]
    fn test_maneuver_ordinals_along_short_route() {
        let config = EngineConfig::default();
        let pts = [meters_east(0.0), meters_east(10.0), meters_east(20.0)];
        let mut session = session_on(
            &pts,
            &[maneuver_at(meters_east(0.0), "Depart"), maneuver_at(meters_east(15.0), "Turn right")],
            &config,
        );

        let mut ordinals = Vec::new();
        let mut advanced_at = Vec::new();
        for (i, d) in [0.0, 5.0, 12.0, 18.0].iter().enumerate() {
            let ts = (i as u64 + 1) * 1_000;
            let step = session.handle_fix(&Fix::new(meters_east(*d), 3.0, ts), at(ts)).unwrap();
            ordinals.push(step.state.active_maneuver);
            if step.has_event(|e| matches!(e, NavEvent::ManeuverAdvanced { .. })) {
                advanced_at.push(i);
            }
        }

        assert_eq!(ordinals, vec![0, 0, 0, 1]);
        assert_eq!(advanced_at, vec![3]);
    }

    #[test]
    fn test_deviation_started_and_ended_once() {
        let config = EngineConfig::default();
        let mut session = long_road(&config);
        let mut steps = Vec::new();
        let mut ts = 0;

        for i in 0..2u64 {
            ts += 1_000;
            steps.push(session.handle_fix(&Fix::new(meters_east(i as f64 * 10.0), 5.0, ts), at(ts)).unwrap());
        }
        for i in 0..8u64 {
            ts += 1_000;
            let fix = Fix::new(grid(20.0 + i as f64 * 10.0, 200.0), 5.0, ts);
            steps.push(session.handle_fix(&fix, at(ts)).unwrap());
        }
        assert_eq!(count(&steps, |e| matches!(e, NavEvent::DeviationStarted { .. })), 1);
        assert!(session.state().deviated);

        for i in 0..8u64 {
            ts += 1_000;
            let fix = Fix::new(grid(100.0 + i as f64 * 10.0, 8.0), 5.0, ts);
            steps.push(session.handle_fix(&fix, at(ts)).unwrap());
        }
        assert_eq!(count(&steps, |e| matches!(e, NavEvent::DeviationStarted { .. })), 1);
        assert_eq!(count(&steps, |e| *e == NavEvent::DeviationEnded), 1);
        assert_eq!(session.phase(), TrackerPhase::OnRoute);
        assert!(!session.state().deviated);
    }

    #[test]
    fn test_nan_fix_leaves_state_unchanged() {
        let config = EngineConfig::default();
        let mut session = long_road(&config);
        session.handle_fix(&Fix::new(meters_east(50.0), 5.0, 1_000), at(1_000)).unwrap();
        let before = session.state().clone();

        let err = session
            .handle_fix(&Fix::new(GeoPoint::new(f64::NAN, 0.0), 5.0, 2_000), at(2_000))
            .unwrap_err();
        assert!(matches!(err, NavError::InvalidFix(_)));
        assert_eq!(session.state(), &before);

        // The next valid fix is still accepted at that timestamp.
        assert!(session.handle_fix(&Fix::new(meters_east(60.0), 5.0, 2_000), at(2_000)).is_ok());
    }

    #[test]
    fn test_stale_and_duplicate_fixes() {
        let config = EngineConfig::default();
        let mut session = long_road(&config);
        let fix = Fix::new(meters_east(50.0), 5.0, 5_000);
        let first = session.handle_fix(&fix, at(5_000)).unwrap();

        let dup = session.handle_fix(&fix, at(5_100)).unwrap();
        assert!(dup.events.is_empty());
        assert_eq!(dup.state, first.state);

        let older = session.handle_fix(&Fix::new(meters_east(40.0), 5.0, 4_000), at(5_200));
        assert!(matches!(older, Err(NavError::StaleFix { timestamp_ms: 4_000, last_accepted_ms: 5_000 })));

        let same_time = session.handle_fix(&Fix::new(meters_east(55.0), 5.0, 5_000), at(5_300));
        assert!(matches!(same_time, Err(NavError::StaleFix { .. })));
        assert_eq!(session.state().sequence, first.state.sequence);
    }

    #[test]
    fn test_state_snapshot_fields() {
        let config = EngineConfig::default();
        let mut session = long_road(&config);
        let step = session.handle_fix(&Fix::new(grid(500.0, 4.0), 5.0, 1_000), at(1_000)).unwrap();
        let s = step.state;
        assert_eq!(s.phase, TrackerPhase::OnRoute);
        assert_eq!(s.sequence, 1);
        assert_eq!(s.next_maneuver, Some(1));
        assert_relative_eq!(s.distance_to_next_m.unwrap(), 1_500.0, epsilon = 1e-2);
        assert_relative_eq!(s.distance_to_end_m, 1_500.0, epsilon = 1e-2);
        assert_relative_eq!(s.progress_fraction, 0.25, epsilon = 1e-5);
        assert_relative_eq!(s.lateral_offset_m.unwrap(), 4.0, epsilon = 1e-3);
        assert_eq!(s.quality, Some(MatchQuality::Good));
        assert_eq!(s.last_fix_ms, Some(1_000));
    }

    #[test]
    fn test_completed_is_terminal() {
        let config = EngineConfig::default();
        let mut session = long_road(&config);
        let mut steps = Vec::new();
        for (i, d) in [1_900.0, 1_995.0, 2_000.0].iter().enumerate() {
            let ts = (i as u64 + 1) * 1_000;
            steps.push(session.handle_fix(&Fix::new(meters_east(*d), 5.0, ts), at(ts)).unwrap());
        }
        assert_eq!(count(&steps, |e| *e == NavEvent::RouteCompleted), 1);
        assert_eq!(session.phase(), TrackerPhase::Completed);
        assert_eq!(session.state().progress_fraction, 1.0);

        let after = session.handle_fix(&Fix::new(meters_east(10.0), 5.0, 9_000), at(9_000)).unwrap();
        assert!(after.events.is_empty());
        assert_eq!(after.state.phase, TrackerPhase::Completed);
    }

    #[test]
    fn test_deviation_issues_replan_request() {
        let config = EngineConfig::default();
        let mut session = long_road(&config);
        let step = deviate(&mut session);

        assert!(step.has_event(|e| matches!(e, NavEvent::ReplanRequested { attempt: 1, .. })));
        let command = step.replan.expect("request on entering deviation");
        assert_eq!(command.attempt, 1);
        assert_eq!(command.request.costing, "bus");
        // Starts at the vehicle and ends at the route end.
        let last_fix = session.last_fix.unwrap().position;
        assert_eq!(command.request.points[0], last_fix);
        assert_eq!(
            command.request.points.last().copied(),
            session.route().geometry().vertices().last().copied()
        );

        // No second request while the first is outstanding.
        let next = session.handle_fix(&Fix::new(grid(300.0, 200.0), 5.0, 60_000), at(8_000)).unwrap();
        assert!(next.replan.is_none());
    }

    #[test]
    fn test_replan_success_replaces_route() {
        let config = EngineConfig::default();
        let mut session = long_road(&config);
        let command = deviate(&mut session).replan.unwrap();

        let detour: Vec<GeoPoint> = (0..=10).map(|i| grid(150.0 + i as f64 * 50.0, 200.0)).collect();
        let response = PlanResponse {
            geometry: detour.clone(),
            maneuvers: start_and_arrive(detour[0], detour[10]),
            total_distance_m: Some(500.0),
        };
        let loaded_version = session.state().route_version;
        let step = session.handle_plan(command.request_id, Ok(response), at(9_000)).unwrap();

        assert!(step.has_event(|e| matches!(e, NavEvent::RouteReplaced { .. })));
        assert_eq!(step.state.route_version, loaded_version);
        assert_eq!(session.route().version(), loaded_version);
        assert_eq!(step.state.phase, TrackerPhase::NotStarted);
        assert_eq!(step.state.replans, 1);
        assert_relative_eq!(session.route().geometry().total_length(), 500.0, epsilon = 1e-3);
        assert_eq!(session.replan_state(), ReplanState::Idle);

        // Tracking resumes on the new geometry.
        let resumed = session.handle_fix(&Fix::new(grid(200.0, 200.0), 5.0, 90_000), at(10_000)).unwrap();
        assert_eq!(resumed.state.phase, TrackerPhase::OnRoute);
        assert_relative_eq!(resumed.state.cursor_m, 50.0, epsilon = 1e-3);
    }

    #[test]
    fn test_replan_failure_backs_off_and_retries() {
        let mut config = EngineConfig::default();
        config.replan = ReplanPolicy {
            cooldown_ms: 0,
            ..ReplanPolicy::default()
        };
        let mut session = long_road(&config);
        let command = deviate(&mut session).replan.unwrap();

        let step = session
            .handle_plan(command.request_id, Err(EnvError::network("refused")), at(20_000))
            .unwrap();
        assert!(step.has_event(|e| matches!(e, NavEvent::ReplanFailed { .. })));
        assert!(step.replan.is_none());
        assert!(session.state().deviated);

        assert!(session.poll(at(21_999)).is_none());
        let retry = session.poll(at(22_000)).unwrap();
        let again = retry.replan.unwrap();
        assert_eq!(again.attempt, 2);
        assert_ne!(again.request_id, command.request_id);

        // The first answer arriving now is discarded.
        assert!(session
            .handle_plan(command.request_id, Ok(PlanResponse::default()), at(22_500))
            .is_none());
    }

    #[test]
    fn test_unusable_plan_counts_as_failure() {
        let mut session = long_road(&EngineConfig::default());
        let command = deviate(&mut session).replan.unwrap();

        let step = session
            .handle_plan(command.request_id, Ok(PlanResponse::default()), at(9_000))
            .unwrap();
        assert!(step.has_event(|e| matches!(
            e,
            NavEvent::ReplanFailed { reason, .. } if reason.contains("empty")
        )));
        assert_eq!(session.phase(), TrackerPhase::Deviated);
        assert!(matches!(session.replan_state(), ReplanState::Waiting { .. }));
    }

    #[test]
    fn test_request_timeout_reported_on_poll() {
        let mut session = long_road(&EngineConfig::default());
        let step = deviate(&mut session);
        let request_id = step.replan.unwrap().request_id;
        let issued = step.state.last_fix_ms.unwrap();

        assert!(session.poll(at(issued + 9_999)).is_none());
        let timed_out = session.poll(at(issued + 10_000)).unwrap();
        assert!(timed_out.has_event(|e| *e == NavEvent::ReplanFailed {
            request_id,
            reason: "timed out".to_string()
        }));
    }

    #[test]
    fn test_recovery_discards_outstanding_plan() {
        let mut session = long_road(&EngineConfig::default());
        let command = deviate(&mut session).replan.unwrap();

        // Recovery well before the request would time out.
        let mut ts = 5_000;
        let mut ended = false;
        for i in 0..8 {
            ts += 1_000;
            let step = session
                .handle_fix(&Fix::new(meters_east(300.0 + i as f64 * 10.0), 5.0, ts), at(ts))
                .unwrap();
            ended |= step.has_event(|e| *e == NavEvent::DeviationEnded);
        }
        assert!(ended);
        assert!(session
            .handle_plan(command.request_id, Ok(PlanResponse::default()), at(ts))
            .is_none());
        assert_eq!(session.route().version(), 1);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let json = serde_json::to_string(&NavEvent::ManeuverAdvanced { from: 0, to: 1 }).unwrap();
        assert_eq!(json, r#"{"type":"maneuver_advanced","from":0,"to":1}"#);
    }
}
