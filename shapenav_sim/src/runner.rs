//! Scenario runner - drives the engine against simulated vehicles.
//!
//! Single-vehicle scenarios drive a [`NavSession`] directly, one simulated
//! second per tick, and deliver planner answers themselves after the
//! planner's latency. The fleet scenario goes through the async
//! [`SessionRuntime`] on a virtual clock instead.

use crate::context::SimContext;
use crate::exporter::{SimExport, SimFrame};
use crate::oracle::{l_route, polyline, with_detour, FaultyTransport, LocalFrame, Oracle};
use crate::planner::SimPlanner;
use crate::scenarios::ScenarioId;

use nalgebra::Vector2;
use serde::Serialize;
use shapenav_core::{
    EngineConfig, Fix, NavError, NavEvent, NavSession, ReplanCommand, RouteRegistry, RouteShape,
    SessionRuntime, SessionStep, SessionUpdate, TrackerPhase,
};
use shapenav_env::{GeoPoint, PlannerController, SessionId, ShapeId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Seconds per simulation tick (fixes arrive at 1 Hz).
const TICK_SECS: f64 = 1.0;

/// Ticks a vehicle may wait at its destination for completion.
const MAX_DWELL_TICKS: u32 = 30;

const FLEET_SIZE: usize = 20;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Fixes handed to the engine (including duplicates and corrupt ones)
    pub total_fixes: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub fixes_sent: u64,

    /// Fixes refused as malformed
    pub rejected: u64,

    /// Fixes older than the last accepted one
    pub stale: u64,

    /// Fixes accepted without effect (duplicates)
    pub ignored: u64,

    pub deviations: u64,
    pub recoveries: u64,
    pub replans_requested: u64,
    pub replans_failed: u64,
    pub routes_replaced: u64,
    pub maneuver_advances: u64,
    pub completed_sessions: u64,
}

impl ScenarioMetrics {
    fn record_events(&mut self, events: &[NavEvent]) {
        for event in events {
            match event {
                NavEvent::ManeuverAdvanced { .. } => self.maneuver_advances += 1,
                NavEvent::DeviationStarted { .. } => self.deviations += 1,
                NavEvent::DeviationEnded => self.recoveries += 1,
                NavEvent::RouteCompleted => self.completed_sessions += 1,
                NavEvent::ReplanRequested { .. } => self.replans_requested += 1,
                NavEvent::ReplanFailed { .. } => self.replans_failed += 1,
                NavEvent::RouteReplaced { .. } => self.routes_replaced += 1,
            }
        }
    }

    fn absorb(&mut self, other: &ScenarioMetrics) {
        self.fixes_sent += other.fixes_sent;
        self.rejected += other.rejected;
        self.stale += other.stale;
        self.ignored += other.ignored;
        self.deviations += other.deviations;
        self.recoveries += other.recoveries;
        self.replans_requested += other.replans_requested;
        self.replans_failed += other.replans_failed;
        self.routes_replaced += other.routes_replaced;
        self.maneuver_advances += other.maneuver_advances;
        self.completed_sessions += other.completed_sessions;
    }
}

/// Collects assertion failures of one scenario.
#[derive(Debug, Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn require(&mut self, ok: bool, describe: impl FnOnce() -> String) {
        if !ok {
            self.failures.push(describe());
        }
    }

    fn failure_reason(&self) -> Option<String> {
        if self.failures.is_empty() {
            None
        } else {
            Some(self.failures.join("; "))
        }
    }
}

// ============================================================================
// SINGLE VEHICLE DRIVER
// ============================================================================

/// One vehicle, its receiver and its session, driven tick by tick.
struct VehicleRun {
    session: NavSession,
    oracle: Oracle,
    transport: Option<FaultyTransport>,

    /// Planner requests and the time (ms) their answer is due
    in_flight: Vec<(u64, ReplanCommand)>,

    metrics: ScenarioMetrics,

    /// Every (from, to) maneuver advance, in order
    advances: Vec<(usize, usize)>,

    /// Request times (ms), one list per deviation episode
    episodes: Vec<Vec<u64>>,

    last_sequence: u64,
}

impl VehicleRun {
    fn new(session: NavSession, oracle: Oracle) -> Self {
        Self {
            last_sequence: session.state().sequence,
            session,
            oracle,
            transport: None,
            in_flight: Vec::new(),
            metrics: ScenarioMetrics::default(),
            advances: Vec::new(),
            episodes: Vec::new(),
        }
    }

    fn with_transport(mut self, transport: FaultyTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    fn phase(&self) -> TrackerPhase {
        self.session.phase()
    }

    /// Drives until completion, a long dwell at the destination, or the
    /// simulation clock reaching `until_secs`.
    fn run_until(&mut self, planner: &SimPlanner, until_secs: f64, mut export: Option<&mut SimExport>) {
        let mut dwell = 0;
        while self.oracle.time() < until_secs {
            let (fix, events) = self.tick(planner);

            if let Some(export) = export.as_deref_mut() {
                let mut frame = SimFrame::new(
                    self.oracle.time(),
                    self.oracle.true_position(),
                    Some(fix.position),
                    self.session.state(),
                );
                frame.events = events;
                export.add_frame(frame);
            }

            if self.phase() == TrackerPhase::Completed {
                break;
            }
            if self.oracle.finished() {
                dwell += 1;
                if dwell > MAX_DWELL_TICKS {
                    warn!("Vehicle waited {}s at its destination without completing", dwell);
                    break;
                }
            }
        }

        let held = self.transport.as_mut().map(FaultyTransport::flush).unwrap_or_default();
        let now_ms = self.oracle.time_ms();
        let mut events = Vec::new();
        for fix in held {
            self.send(fix, now_ms, planner, &mut events);
        }
    }

    /// One simulated second: planner answers, the new fix, a clock poll.
    fn tick(&mut self, planner: &SimPlanner) -> (Fix, Vec<NavEvent>) {
        self.oracle.step(TICK_SECS);
        let now_ms = self.oracle.time_ms();
        let now = Duration::from_millis(now_ms);
        let mut events = Vec::new();

        let (due, waiting): (Vec<_>, Vec<_>) = self.in_flight.drain(..).partition(|(at, _)| *at <= now_ms);
        self.in_flight = waiting;
        for (_, command) in due {
            let result = planner.respond(&command.request);
            if let Some(step) = self.session.handle_plan(command.request_id, result, now) {
                self.absorb(step, now_ms, planner, &mut events);
            }
        }

        let fix = self.oracle.generate_fix();
        let deliveries = match self.transport.as_mut() {
            Some(transport) => transport.deliver(fix),
            None => vec![fix],
        };
        for delivered in deliveries {
            self.send(delivered, now_ms, planner, &mut events);
        }

        if let Some(step) = self.session.poll(now) {
            self.absorb(step, now_ms, planner, &mut events);
        }
        (fix, events)
    }

    fn send(&mut self, fix: Fix, now_ms: u64, planner: &SimPlanner, events: &mut Vec<NavEvent>) {
        self.metrics.fixes_sent += 1;
        match self.session.handle_fix(&fix, Duration::from_millis(now_ms)) {
            Ok(step) => {
                if step.state.sequence == self.last_sequence {
                    self.metrics.ignored += 1;
                }
                self.absorb(step, now_ms, planner, events);
            }
            Err(NavError::StaleFix { .. }) => self.metrics.stale += 1,
            Err(e) => {
                debug!("Fix at {}ms rejected: {}", fix.timestamp_ms, e);
                self.metrics.rejected += 1;
            }
        }
    }

    fn absorb(&mut self, step: SessionStep, now_ms: u64, planner: &SimPlanner, events: &mut Vec<NavEvent>) {
        self.last_sequence = step.state.sequence;
        self.metrics.record_events(&step.events);

        for event in &step.events {
            match event {
                NavEvent::ManeuverAdvanced { from, to } => self.advances.push((*from, *to)),
                NavEvent::DeviationStarted { .. } => self.episodes.push(Vec::new()),
                NavEvent::ReplanRequested { .. } => {
                    if let Some(episode) = self.episodes.last_mut() {
                        episode.push(now_ms);
                    }
                }
                _ => {}
            }
        }

        if let Some(command) = step.replan {
            self.in_flight.push((now_ms + planner.latency_ms(), command));
        }
        events.extend(step.events);
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Engine configuration shared by every session
    config: EngineConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_duration_secs: 600.0,
            config: EngineConfig::default(),
        }
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario and records one frame per tick of its first vehicle.
    pub fn run_exported(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let mut export = SimExport::new(scenario.name(), self.seed);
        let result = self.execute(scenario, Some(&mut export));
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, export: Option<&mut SimExport>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::Commute => self.run_commute(export),
            ScenarioId::UrbanCanyon => self.run_urban_canyon(export),
            ScenarioId::Detour => self.run_detour(export),
            ScenarioId::PlannerOutage => self.run_planner_outage(export),
            ScenarioId::ShuffledDelivery => self.run_shuffled_delivery(export),
            ScenarioId::HotReload => self.run_hot_reload(export),
            ScenarioId::Fleet => self.run_fleet(export),
        };

        outcome.unwrap_or_else(|reason| {
            warn!("Scenario {} could not be set up: {}", scenario.name(), reason);
            ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_fixes: 0,
                final_time_secs: 0.0,
                failure_reason: Some(reason),
                metrics: ScenarioMetrics::default(),
            }
        })
    }

    fn physics_seed(&self) -> u64 {
        self.seed.wrapping_mul(0x9e3779b97f4a7c15)
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        checks: Checks,
        metrics: ScenarioMetrics,
        final_time_secs: f64,
    ) -> ScenarioResult {
        let failure_reason = checks.failure_reason();
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_fixes: metrics.fixes_sent,
            final_time_secs,
            failure_reason,
            metrics,
        }
    }

    /// Loads a shape through the planner, the way a feed import would.
    fn load_shape(
        &self,
        registry: &RouteRegistry,
        planner: &SimPlanner,
        shape_id: &str,
        points: &[GeoPoint],
    ) -> Result<Arc<RouteShape>, String> {
        let runtime = &self.config.runtime;
        block_on(registry.load_with_planner(
            planner,
            ShapeId::from(shape_id),
            points,
            &runtime.costing,
            runtime.request_min_step_m,
        ))?
        .map_err(|e| format!("loading {}: {}", shape_id, e))
    }

    /// A single vehicle on a freshly loaded route.
    fn single_vehicle(
        &self,
        planner: &SimPlanner,
        route_path: &[Vector2<f64>],
        driven: Vec<Vector2<f64>>,
        export: Option<&mut SimExport>,
    ) -> Result<(Arc<RouteShape>, VehicleRun), String> {
        let mut oracle = Oracle::new(self.physics_seed());
        let points = oracle.frame().path_to_geo(route_path);
        let registry = RouteRegistry::new(self.config.maneuvers.clone());
        let route = self.load_shape(&registry, planner, "line-1", &points)?;
        if let Some(export) = export {
            export.set_route(&points);
        }

        oracle.drive(driven);
        let session = NavSession::new(SessionId::from_seed(self.seed), route.clone(), &self.config);
        Ok((route, VehicleRun::new(session, oracle)))
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    /// NAV-001: Commute - clean fixes, the baseline.
    ///
    /// **Assertion**: completes on the last maneuver without any deviation.
    fn run_commute(&self, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        info!("NAV-001: Commute - clean drive");

        let planner = SimPlanner::new();
        let path = l_route(1_500.0, 800.0, 50.0);
        let (route, mut run) = self.single_vehicle(&planner, &path, path.clone(), export.as_deref_mut())?;
        run.run_until(&planner, self.max_duration_secs, export);

        let mut checks = Checks::default();
        let last = route.maneuvers().last_ordinal();
        checks.require(run.phase() == TrackerPhase::Completed, || {
            format!("ended in {:?}", run.phase())
        });
        checks.require(run.metrics.deviations == 0, || {
            format!("{} false deviations", run.metrics.deviations)
        });
        checks.require(run.session.state().active_maneuver == last, || {
            format!("ended on maneuver {} of {}", run.session.state().active_maneuver, last)
        });

        info!(
            "✓ Commute complete: {} fixes, {} maneuver advances",
            run.metrics.fixes_sent, run.metrics.maneuver_advances
        );
        Ok(self.finish(ScenarioId::Commute, checks, run.metrics, run.oracle.time()))
    }

    /// NAV-002: UrbanCanyon - multipath and corrupt fixes.
    ///
    /// **Assertion**: no deviation, corrupt fixes rejected, route completed.
    fn run_urban_canyon(&self, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        info!("NAV-002: UrbanCanyon - noisy receiver");

        let planner = SimPlanner::new();
        let path = l_route(1_500.0, 800.0, 50.0);
        let (_, mut run) = self.single_vehicle(&planner, &path, path.clone(), export.as_deref_mut())?;
        run.oracle.set_position_noise(12.0, 15.0);
        run.oracle.set_outliers(0.03, 150.0);
        run.oracle.set_invalid_rate(0.05);
        run.run_until(&planner, self.max_duration_secs, export);

        let mut checks = Checks::default();
        checks.require(run.phase() == TrackerPhase::Completed, || {
            format!("ended in {:?}", run.phase())
        });
        checks.require(run.metrics.deviations == 0, || {
            format!("{} false deviations", run.metrics.deviations)
        });
        checks.require(run.metrics.rejected > 0, || "no corrupt fix was rejected".to_string());

        info!(
            "✓ UrbanCanyon complete: {} fixes, {} rejected",
            run.metrics.fixes_sent, run.metrics.rejected
        );
        Ok(self.finish(ScenarioId::UrbanCanyon, checks, run.metrics, run.oracle.time()))
    }

    /// NAV-003: Detour - vehicle leaves the route over a side street.
    ///
    /// **Assertion**: one deviation, a bounded number of requests, the
    /// re-planned route is driven to completion.
    fn run_detour(&self, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        info!("NAV-003: Detour - side street and re-plan");

        let planner = SimPlanner::new();
        let path = l_route(2_000.0, 800.0, 50.0);
        let detour = with_detour(&path, 300.0, 1_500.0, 150.0, 25.0);
        let (_, mut run) = self.single_vehicle(&planner, &path, detour.driven, export.as_deref_mut())?;
        planner.add_street(run.oracle.frame().path_to_geo(&detour.street));
        run.run_until(&planner, self.max_duration_secs, export);

        let m = &run.metrics;
        let mut checks = Checks::default();
        checks.require(m.deviations >= 1, || "deviation never detected".to_string());
        checks.require((1..=3).contains(&m.replans_requested), || {
            format!("{} re-plan requests", m.replans_requested)
        });
        checks.require(m.routes_replaced >= 1, || "route never replaced".to_string());
        checks.require(run.phase() == TrackerPhase::Completed, || {
            format!("ended in {:?}", run.phase())
        });

        info!(
            "✓ Detour complete: {} deviations, {} requests, {} replacements",
            m.deviations, m.replans_requested, m.routes_replaced
        );
        Ok(self.finish(ScenarioId::Detour, checks, run.metrics, run.oracle.time()))
    }

    /// NAV-004: PlannerOutage - re-plan while the planner keeps failing.
    ///
    /// **Assertion**: requests of one episode are at least a cooldown apart,
    /// and the first successful answer is applied.
    fn run_planner_outage(&self, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        info!("NAV-004: PlannerOutage - failing planner");

        let mut config = self.config.clone();
        config.replan.cooldown_ms = 5_000;
        let runner = ScenarioRunner {
            seed: self.seed,
            max_duration_secs: self.max_duration_secs,
            config,
        };
        let cooldown_ms = runner.config.replan.cooldown_ms;

        let planner = SimPlanner::new();
        let path = l_route(2_000.0, 800.0, 50.0);
        let detour = with_detour(&path, 300.0, 1_500.0, 150.0, 25.0);
        let (_, mut run) = runner.single_vehicle(&planner, &path, detour.driven, export.as_deref_mut())?;
        planner.add_street(run.oracle.frame().path_to_geo(&detour.street));
        planner.fail_next(3);
        run.run_until(&planner, runner.max_duration_secs, export);

        let m = &run.metrics;
        let mut checks = Checks::default();
        checks.require(m.replans_failed >= 3, || format!("only {} failed requests", m.replans_failed));
        checks.require(m.routes_replaced >= 1, || "route never replaced".to_string());
        checks.require(planner.failures() == 3, || {
            format!("planner failed {} times", planner.failures())
        });
        for (i, episode) in run.episodes.iter().enumerate() {
            for w in episode.windows(2) {
                checks.require(w[1] - w[0] >= cooldown_ms, || {
                    format!("episode {} requests {}ms apart", i + 1, w[1] - w[0])
                });
            }
        }
        checks.require(run.phase() == TrackerPhase::Completed, || {
            format!("ended in {:?}", run.phase())
        });

        info!(
            "✓ PlannerOutage complete: {} requests, {} failed, {} replaced",
            m.replans_requested, m.replans_failed, m.routes_replaced
        );
        Ok(self.finish(ScenarioId::PlannerOutage, checks, run.metrics, run.oracle.time()))
    }

    /// NAV-005: ShuffledDelivery - reordered and duplicated fixes.
    ///
    /// **Assertion**: late fixes are dropped as stale, maneuvers only ever
    /// advance, the route completes.
    fn run_shuffled_delivery(&self, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        info!("NAV-005: ShuffledDelivery - unreliable transport");

        let planner = SimPlanner::new();
        let path = l_route(1_500.0, 800.0, 50.0);
        let (_, run) = self.single_vehicle(&planner, &path, path.clone(), export.as_deref_mut())?;
        let transport = FaultyTransport::new(self.physics_seed() ^ 0x5eed, 0.2, 0.1);
        let mut run = run.with_transport(transport);
        run.run_until(&planner, self.max_duration_secs, export);

        let mut checks = Checks::default();
        checks.require(run.phase() == TrackerPhase::Completed, || {
            format!("ended in {:?}", run.phase())
        });
        checks.require(run.metrics.stale > 0, || "no fix arrived late".to_string());
        checks.require(run.metrics.ignored > 0, || "no duplicate was delivered".to_string());
        checks.require(run.advances.iter().all(|(from, to)| from < to), || {
            format!("backward advance in {:?}", run.advances)
        });
        checks.require(run.advances.windows(2).all(|w| w[0].1 < w[1].1), || {
            format!("non-monotonic advances {:?}", run.advances)
        });

        info!(
            "✓ ShuffledDelivery complete: {} stale, {} duplicates",
            run.metrics.stale, run.metrics.ignored
        );
        Ok(self.finish(ScenarioId::ShuffledDelivery, checks, run.metrics, run.oracle.time()))
    }

    /// NAV-006: HotReload - shape replaced while a vehicle is driving it.
    ///
    /// **Assertion**: the running session keeps its version, a new session
    /// gets the new one, a broken reload changes nothing.
    fn run_hot_reload(&self, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        info!("NAV-006: HotReload - shape reload mid-trip");

        let planner = SimPlanner::new();
        let registry = RouteRegistry::shared(self.config.maneuvers.clone());
        let frame = LocalFrame::default();
        let v1_path = l_route(1_200.0, 600.0, 50.0);
        let v2_path = l_route(1_200.0, 900.0, 50.0);
        let shape = ShapeId::from("line-5");

        let v1_points = frame.path_to_geo(&v1_path);
        let v1 = self.load_shape(&registry, &planner, shape.as_str(), &v1_points)?;
        if let Some(export) = export.as_deref_mut() {
            export.set_route(&v1_points);
        }

        let mut oracle = Oracle::new(self.physics_seed());
        oracle.drive(v1_path);
        let session = NavSession::new(SessionId::from_seed(self.seed), v1.clone(), &self.config);
        let mut first = VehicleRun::new(session, oracle);
        first.run_until(&planner, 60.0, export.as_deref_mut());

        let v2 = self.load_shape(&registry, &planner, shape.as_str(), &frame.path_to_geo(&v2_path))?;
        let current = registry
            .get(&shape)
            .ok_or_else(|| format!("shape {} vanished", shape))?;

        let mut oracle = Oracle::new(self.physics_seed() ^ 1);
        oracle.drive(v2_path);
        let session = NavSession::new(SessionId::from_seed(self.seed.wrapping_add(1)), current, &self.config);
        let mut second = VehicleRun::new(session, oracle);

        first.run_until(&planner, self.max_duration_secs, export);
        second.run_until(&planner, self.max_duration_secs, None);

        let broken = registry.load(shape.clone(), &v1_points[..1], &[]);
        let after = registry.get(&shape).map(|r| r.version());

        let mut checks = Checks::default();
        checks.require(v2.version() > v1.version(), || "reload did not bump the version".to_string());
        checks.require(first.session.state().route_version == v1.version(), || {
            format!("first session moved to v{}", first.session.state().route_version)
        });
        checks.require(second.session.state().route_version == v2.version(), || {
            format!("second session started on v{}", second.session.state().route_version)
        });
        checks.require(first.phase() == TrackerPhase::Completed, || {
            format!("first session ended in {:?}", first.phase())
        });
        checks.require(second.phase() == TrackerPhase::Completed, || {
            format!("second session ended in {:?}", second.phase())
        });
        checks.require(matches!(&broken, Err(e) if e.is_fatal()), || {
            "broken reload was accepted".to_string()
        });
        checks.require(after == Some(v2.version()), || {
            format!("broken reload left version {:?}", after)
        });

        let mut metrics = first.metrics.clone();
        metrics.absorb(&second.metrics);
        let final_time = first.oracle.time().max(second.oracle.time());
        info!(
            "✓ HotReload complete: v{} -> v{}, both sessions finished",
            v1.version(),
            v2.version()
        );
        Ok(self.finish(ScenarioId::HotReload, checks, metrics, final_time))
    }

    /// NAV-007: Fleet - concurrent sessions through the async runtime.
    ///
    /// **Assertion**: every vehicle completes and each session's updates
    /// arrive with strictly increasing sequence numbers.
    fn run_fleet(&self, export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        info!("NAV-007: Fleet - {} concurrent sessions", FLEET_SIZE);
        block_on(self.fleet(export))?
    }

    async fn fleet(&self, export: Option<&mut SimExport>) -> Result<ScenarioResult, String> {
        let ctx = SimContext::shared(self.seed);
        let planner = Arc::new(SimPlanner::new().with_clock(ctx.clone()));
        let registry = RouteRegistry::shared(self.config.maneuvers.clone());
        let frame = LocalFrame::default();

        let shapes: Vec<(ShapeId, Vec<Vector2<f64>>)> = vec![
            (ShapeId::from("line-1"), l_route(1_000.0, 400.0, 50.0)),
            (
                ShapeId::from("line-2"),
                polyline(&[Vector2::new(0.0, 0.0), Vector2::new(0.0, 1_200.0)], 50.0),
            ),
            (
                ShapeId::from("line-3"),
                polyline(
                    &[
                        Vector2::new(0.0, 0.0),
                        Vector2::new(600.0, 0.0),
                        Vector2::new(600.0, -500.0),
                        Vector2::new(1_000.0, -500.0),
                    ],
                    50.0,
                ),
            ),
        ];

        let rt_config = &self.config.runtime;
        for (shape_id, path) in &shapes {
            let points = frame.path_to_geo(path);
            registry
                .load_with_planner(
                    planner.as_ref(),
                    shape_id.clone(),
                    &points,
                    &rt_config.costing,
                    rt_config.request_min_step_m,
                )
                .await
                .map_err(|e| format!("loading {}: {}", shape_id, e))?;
        }
        if let Some(export) = export {
            export.set_route(&frame.path_to_geo(&shapes[0].1));
        }

        let runtime = SessionRuntime::new(ctx.clone(), planner.clone(), registry, self.config.clone());
        let (tx, mut rx) = mpsc::channel::<SessionUpdate>(FLEET_SIZE * 4);

        struct Vehicle {
            id: SessionId,
            oracle: Oracle,
            last_sequence: u64,
            sent_ms: u64,
            done: bool,
        }

        let mut vehicles = Vec::with_capacity(FLEET_SIZE);
        let mut by_id = HashMap::new();
        for i in 0..FLEET_SIZE {
            let (shape_id, path) = &shapes[i % shapes.len()];
            let id = SessionId::from_seed(self.seed.wrapping_add(i as u64));
            let mut oracle = Oracle::new(self.physics_seed().wrapping_add(i as u64));
            oracle.set_speed(8.0 + (i % 5) as f64);
            oracle.drive(path.clone());
            runtime
                .start_session(id, shape_id, tx.clone())
                .map_err(|e| e.to_string())?;
            by_id.insert(id, vehicles.len());
            vehicles.push(Vehicle {
                id,
                oracle,
                last_sequence: 0,
                sent_ms: 0,
                done: false,
            });
        }
        drop(tx);

        let mut metrics = ScenarioMetrics::default();
        let mut out_of_order = 0u64;
        let mut elapsed = 0.0;

        while vehicles.iter().any(|v| !v.done) && elapsed < self.max_duration_secs {
            ctx.advance_time(Duration::from_secs_f64(TICK_SECS));
            elapsed += TICK_SECS;

            let mut waiting = HashSet::new();
            for v in vehicles.iter_mut().filter(|v| !v.done) {
                v.oracle.step(TICK_SECS);
                let fix = v.oracle.generate_fix();
                v.sent_ms = fix.timestamp_ms;
                runtime.ingest(v.id, fix).await.map_err(|e| e.to_string())?;
                metrics.fixes_sent += 1;
                waiting.insert(v.id);
            }

            while !waiting.is_empty() {
                let update = match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                    Ok(Some(update)) => update,
                    Ok(None) => return Err("update channel closed early".to_string()),
                    Err(_) => return Err(format!("fleet stalled at t={:.0}s", elapsed)),
                };
                let Some(&index) = by_id.get(&update.session_id) else {
                    continue;
                };
                let v = &mut vehicles[index];

                // Rejections repeat the current state.
                let regressed = if update.rejected.is_some() {
                    update.state.sequence < v.last_sequence
                } else {
                    update.state.sequence <= v.last_sequence
                };
                if regressed {
                    out_of_order += 1;
                }
                v.last_sequence = update.state.sequence;
                metrics.record_events(&update.events);
                if update.rejected.is_some() {
                    metrics.rejected += 1;
                }
                if update.rejected.is_some() || update.state.last_fix_ms == Some(v.sent_ms) {
                    waiting.remove(&v.id);
                }
                if update.state.phase == TrackerPhase::Completed {
                    v.done = true;
                }
            }

            if (elapsed as u64) % 30 == 0 {
                debug!(
                    "  t={:.0}s | active={} | completed={}",
                    elapsed,
                    vehicles.iter().filter(|v| !v.done).count(),
                    metrics.completed_sessions
                );
            }
        }

        for v in &vehicles {
            runtime.end_session(v.id).await.map_err(|e| e.to_string())?;
        }
        // Every worker drops its sender after Shutdown.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => return Err("sessions did not shut down".to_string()),
            }
        }

        let unfinished = vehicles.iter().filter(|v| !v.done).count();
        let mut checks = Checks::default();
        checks.require(unfinished == 0, || format!("{} vehicles never completed", unfinished));
        checks.require(out_of_order == 0, || format!("{} out-of-order updates", out_of_order));
        checks.require(metrics.completed_sessions == FLEET_SIZE as u64, || {
            format!("{} completion events", metrics.completed_sessions)
        });
        checks.require(runtime.active_sessions().is_empty(), || "sessions still registered".to_string());

        info!(
            "✓ Fleet complete: {} sessions, {} fixes, {} planner calls",
            FLEET_SIZE,
            metrics.fixes_sent,
            planner.calls()
        );
        Ok(self.finish(ScenarioId::Fleet, checks, metrics, elapsed))
    }
}

/// Runs a future to completion on a fresh current-thread runtime.
fn block_on<F: Future>(future: F) -> Result<F::Output, String> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map(|rt| rt.block_on(future))
        .map_err(|e| format!("failed to start runtime: {}", e))
}
