//! The "CURSOR" Engine - Progress Tracker
//!
//! State machine over successive matched points:
//!
//! ```text
//! NotStarted ──first usable match──▶ OnRoute ──monitor──▶ Deviated
//!      ▲                               │  ▲                  │
//!      └────────── reset (re-plan) ────┼──┴──── recover ─────┘
//!                                      ▼
//!                                  Completed
//! ```
//!
//! The progress cursor only moves backward inside `backward_tolerance_m`;
//! larger regressions are treated as GPS noise and the cursor is held.
//! The active maneuver ordinal never decreases.

use serde::{Deserialize, Serialize};

use crate::shapenav_maneuvers::ManeuverIndex;
use crate::shapenav_matcher::{MatchQuality, MatchedPoint};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Regressions larger than this hold the cursor (meters)
    pub backward_tolerance_m: f64,

    /// Distance from the route end that counts as arrived (meters)
    pub completion_tolerance_m: f64,

    /// Consecutive in-tolerance fixes required to complete
    pub completion_confirmations: u32,

    /// Lowest quality that may start tracking
    pub start_min_quality: MatchQuality,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            backward_tolerance_m: 25.0,
            completion_tolerance_m: 10.0,
            completion_confirmations: 2,
            start_min_quality: MatchQuality::Poor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerPhase {
    NotStarted,
    OnRoute,
    Deviated,
    Completed,
}

/// What one observation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressUpdate {
    /// Tracking began with this fix
    pub started: bool,

    /// Active ordinal increased (from, to)
    pub advanced: Option<(usize, usize)>,

    /// Route completed with this fix
    pub completed: bool,

    /// The fix regressed beyond tolerance and was ignored for the cursor
    pub cursor_held: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    config: ProgressConfig,
    phase: TrackerPhase,

    /// Monotonic progress (meters along route)
    cursor_m: f64,

    /// Furthest cursor so far; the cursor never drops more than the
    /// backward tolerance below it
    peak_m: f64,

    /// Last raw along-route distance, recorded in every phase
    raw_m: Option<f64>,

    active_ordinal: usize,
    completion_target_m: f64,
    completion_streak: u32,
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig, completion_target_m: f64) -> Self {
        Self {
            config,
            phase: TrackerPhase::NotStarted,
            cursor_m: 0.0,
            peak_m: 0.0,
            raw_m: None,
            active_ordinal: 0,
            completion_target_m,
            completion_streak: 0,
        }
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn cursor_m(&self) -> f64 {
        self.cursor_m
    }

    pub fn raw_m(&self) -> Option<f64> {
        self.raw_m
    }

    pub fn active_ordinal(&self) -> usize {
        self.active_ordinal
    }

    pub fn completion_target_m(&self) -> f64 {
        self.completion_target_m
    }

    /// True when the deviation monitor should be fed.
    pub fn is_tracking(&self) -> bool {
        matches!(self.phase, TrackerPhase::OnRoute | TrackerPhase::Deviated)
    }

    /// Feeds one matched point.
    pub fn observe(&mut self, matched: &MatchedPoint, maneuvers: &ManeuverIndex) -> ProgressUpdate {
        let mut update = ProgressUpdate::default();
        let d = matched.cumulative_m;

        match self.phase {
            TrackerPhase::Completed => return update,
            TrackerPhase::NotStarted => {
                self.raw_m = Some(d);
                if matched.quality < self.config.start_min_quality {
                    return update;
                }
                self.phase = TrackerPhase::OnRoute;
                self.cursor_m = d;
                self.peak_m = d;
                self.active_ordinal = maneuvers.find_active(d);
                update.started = true;
            }
            TrackerPhase::OnRoute => {
                self.raw_m = Some(d);
                if d < self.peak_m - self.config.backward_tolerance_m {
                    update.cursor_held = true;
                } else {
                    self.cursor_m = d;
                    self.peak_m = self.peak_m.max(d);
                    let candidate = maneuvers.find_active(d);
                    if candidate > self.active_ordinal {
                        update.advanced = Some((self.active_ordinal, candidate));
                        self.active_ordinal = candidate;
                    }
                }
            }
            TrackerPhase::Deviated => {
                // Raw progress only; maneuvers wait for recovery.
                self.raw_m = Some(d);
                return update;
            }
        }

        if self.check_completion(d) {
            self.phase = TrackerPhase::Completed;
            self.cursor_m = self.cursor_m.max(d);
            self.peak_m = self.peak_m.max(self.cursor_m);
            let last = maneuvers.last_ordinal();
            if last > self.active_ordinal {
                let from = update.advanced.map_or(self.active_ordinal, |(from, _)| from);
                update.advanced = Some((from, last));
                self.active_ordinal = last;
            }
            update.completed = true;
        }

        update
    }

    fn check_completion(&mut self, raw_m: f64) -> bool {
        if raw_m >= self.completion_target_m - self.config.completion_tolerance_m {
            self.completion_streak += 1;
        } else {
            self.completion_streak = 0;
        }
        self.completion_streak >= self.config.completion_confirmations.max(1)
    }

    /// OnRoute → Deviated. Returns false when not on route.
    pub fn enter_deviation(&mut self) -> bool {
        if self.phase != TrackerPhase::OnRoute {
            return false;
        }
        self.phase = TrackerPhase::Deviated;
        self.completion_streak = 0;
        true
    }

    /// Deviated → OnRoute. Returns false when not deviated.
    pub fn recover(&mut self) -> bool {
        if self.phase != TrackerPhase::Deviated {
            return false;
        }
        self.phase = TrackerPhase::OnRoute;
        true
    }

    /// Back to NotStarted against a new route.
    pub fn reset(&mut self, completion_target_m: f64) {
        *self = Self::new(self.config.clone(), completion_target_m);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapenav_geometry::GeometryStore;
    use crate::shapenav_maneuvers::ManeuverConfig;
    use crate::test_support::{maneuver_at, meters_east};
    use proptest::prelude::*;
    use shapenav_env::GeoPoint;

    fn maneuvers() -> ManeuverIndex {
        let store = GeometryStore::build(&[meters_east(0.0), meters_east(100.0), meters_east(200.0)]).unwrap();
        ManeuverIndex::build(
            &store,
            &[
                maneuver_at(meters_east(0.0), "Depart"),
                maneuver_at(meters_east(80.0), "Turn right"),
                maneuver_at(meters_east(150.0), "Turn left"),
                maneuver_at(meters_east(200.0), "Arrive"),
            ],
            &ManeuverConfig::default(),
        )
        .unwrap()
    }

    fn matched(d: f64, quality: MatchQuality) -> MatchedPoint {
        MatchedPoint {
            point: GeoPoint::new(0.0, 0.0),
            segment_index: 0,
            cumulative_m: d,
            lateral_offset_m: 0.0,
            quality,
            heading_delta_deg: None,
        }
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(ProgressConfig::default(), 200.0)
    }

    #[test]
    fn test_start_requires_quality_floor() {
        let idx = maneuvers();
        let mut t = tracker();
        let u = t.observe(&matched(10.0, MatchQuality::Bad), &idx);
        assert!(!u.started);
        assert_eq!(t.phase(), TrackerPhase::NotStarted);
        assert_eq!(t.raw_m(), Some(10.0));

        let u = t.observe(&matched(12.0, MatchQuality::Poor), &idx);
        assert!(u.started);
        assert_eq!(t.phase(), TrackerPhase::OnRoute);
        assert_eq!(t.cursor_m(), 12.0);
    }

    #[test]
    fn test_start_mid_route_sets_ordinal_without_event() {
        let idx = maneuvers();
        let mut t = tracker();
        let u = t.observe(&matched(90.0, MatchQuality::Good), &idx);
        assert!(u.started);
        assert_eq!(u.advanced, None);
        assert_eq!(t.active_ordinal(), 1);
    }

    #[test]
    fn test_advance_emitted_exactly_on_increase() {
        let idx = maneuvers();
        let mut t = tracker();
        let mut advances = Vec::new();
        for d in [0.0, 40.0, 79.0, 81.0, 90.0, 149.0, 151.0] {
            if let Some(a) = t.observe(&matched(d, MatchQuality::Good), &idx).advanced {
                advances.push(a);
            }
        }
        assert_eq!(advances, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_backward_noise_holds_cursor() {
        let idx = maneuvers();
        let mut t = tracker();
        t.observe(&matched(100.0, MatchQuality::Good), &idx);

        let small = t.observe(&matched(90.0, MatchQuality::Good), &idx);
        assert!(!small.cursor_held);
        assert_eq!(t.cursor_m(), 90.0);

        let big = t.observe(&matched(20.0, MatchQuality::Good), &idx);
        assert!(big.cursor_held);
        assert_eq!(t.cursor_m(), 90.0);
        assert_eq!(t.raw_m(), Some(20.0));
        assert_eq!(t.active_ordinal(), 1);
    }

    #[test]
    fn test_small_backward_steps_cannot_walk_cursor_back() {
        let idx = maneuvers();
        let mut t = ProgressTracker::new(ProgressConfig::default(), 1e9);
        let tolerance = ProgressConfig::default().backward_tolerance_m;
        t.observe(&matched(150.0, MatchQuality::Good), &idx);

        for d in (0..7).map(|i| 130.0 - 20.0 * i as f64) {
            t.observe(&matched(d, MatchQuality::Good), &idx);
            assert!(150.0 - t.cursor_m() <= tolerance, "cursor fell to {}", t.cursor_m());
        }
        assert_eq!(t.cursor_m(), 130.0);
        assert_eq!(t.raw_m(), Some(10.0));
    }

    #[test]
    fn test_reset_clears_high_water_mark() {
        let idx = maneuvers();
        let mut t = tracker();
        t.observe(&matched(180.0, MatchQuality::Good), &idx);
        t.reset(200.0);
        t.observe(&matched(10.0, MatchQuality::Good), &idx);
        let u = t.observe(&matched(20.0, MatchQuality::Good), &idx);
        assert!(!u.cursor_held);
        assert_eq!(t.cursor_m(), 20.0);
    }

    #[test]
    fn test_ordinal_never_decreases_inside_tolerance() {
        let idx = maneuvers();
        let mut t = tracker();
        t.observe(&matched(82.0, MatchQuality::Good), &idx);
        assert_eq!(t.active_ordinal(), 1);
        t.observe(&matched(70.0, MatchQuality::Good), &idx);
        assert_eq!(t.active_ordinal(), 1);
    }

    #[test]
    fn test_deviated_records_raw_only() {
        let idx = maneuvers();
        let mut t = tracker();
        t.observe(&matched(50.0, MatchQuality::Good), &idx);
        assert!(t.enter_deviation());
        assert!(!t.enter_deviation());

        let u = t.observe(&matched(160.0, MatchQuality::Poor), &idx);
        assert_eq!(u, ProgressUpdate::default());
        assert_eq!(t.cursor_m(), 50.0);
        assert_eq!(t.raw_m(), Some(160.0));
        assert_eq!(t.active_ordinal(), 0);

        assert!(t.recover());
        let u = t.observe(&matched(160.0, MatchQuality::Good), &idx);
        assert_eq!(u.advanced, Some((0, 2)));
    }

    #[test]
    fn test_completion_needs_confirmation() {
        let idx = maneuvers();
        let mut t = tracker();
        t.observe(&matched(150.0, MatchQuality::Good), &idx);

        let first = t.observe(&matched(195.0, MatchQuality::Good), &idx);
        assert!(!first.completed);

        // Regression out of the window restarts the count.
        t.observe(&matched(185.0, MatchQuality::Good), &idx);
        assert_eq!(t.phase(), TrackerPhase::OnRoute);

        t.observe(&matched(192.0, MatchQuality::Good), &idx);
        let done = t.observe(&matched(199.0, MatchQuality::Good), &idx);
        assert!(done.completed);
        assert_eq!(t.phase(), TrackerPhase::Completed);
        assert_eq!(t.active_ordinal(), idx.last_ordinal());

        let after = t.observe(&matched(10.0, MatchQuality::Good), &idx);
        assert_eq!(after, ProgressUpdate::default());
        assert_eq!(t.phase(), TrackerPhase::Completed);
    }

    #[test]
    fn test_reset_returns_to_not_started() {
        let idx = maneuvers();
        let mut t = tracker();
        t.observe(&matched(120.0, MatchQuality::Good), &idx);
        t.enter_deviation();
        t.reset(300.0);
        assert_eq!(t.phase(), TrackerPhase::NotStarted);
        assert_eq!(t.cursor_m(), 0.0);
        assert_eq!(t.active_ordinal(), 0);
        assert_eq!(t.completion_target_m(), 300.0);
    }

    proptest! {
        #[test]
        fn prop_cursor_regresses_at_most_tolerance(
            ds in proptest::collection::vec(0.0f64..200.0, 1..60),
        ) {
            let idx = maneuvers();
            let mut t = ProgressTracker::new(ProgressConfig::default(), 1e9);
            let tolerance = ProgressConfig::default().backward_tolerance_m;
            let mut peak = f64::NEG_INFINITY;
            let mut prev_ordinal = 0;
            for d in ds {
                t.observe(&matched(d, MatchQuality::Good), &idx);
                peak = peak.max(t.cursor_m());
                prop_assert!(t.cursor_m() >= peak - tolerance);
                prop_assert!(t.active_ordinal() >= prev_ordinal);
                prev_ordinal = t.active_ordinal();
            }
        }
    }
}
