//! JSON exporter for offline inspection of a run.
//!
//! One frame per simulated second: where the vehicle really was, the fix it
//! reported, where the engine matched it and what the engine concluded.

use serde::{Deserialize, Serialize};
use shapenav_core::{NavEvent, NavigationState, TrackerPhase};
use shapenav_env::GeoPoint;
use std::fs::File;
use std::io::Write;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Ground truth position
    pub truth: GeoPoint,

    /// Reported position (absent when the fix was held back or corrupt)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<GeoPoint>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<GeoPoint>,

    pub phase: TrackerPhase,
    pub active_maneuver: usize,
    pub cursor_m: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lateral_offset_m: Option<f64>,

    pub route_version: u64,

    /// Events produced during this second
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<NavEvent>,
}

impl SimFrame {
    pub fn new(time_sec: f64, truth: GeoPoint, fix: Option<GeoPoint>, state: &NavigationState) -> Self {
        Self {
            time_sec,
            truth,
            fix: fix.filter(GeoPoint::is_valid),
            matched: state.matched_position,
            phase: state.phase,
            active_maneuver: state.active_maneuver,
            cursor_m: state.cursor_m,
            lateral_offset_m: state.lateral_offset_m,
            route_version: state.route_version,
            events: Vec::new(),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// Route geometry the first session started on
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<GeoPoint>,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            route: Vec::new(),
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    pub fn set_route(&mut self, route: &[GeoPoint]) {
        self.route = route.to_vec();
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_tracks_duration_and_outcome() {
        let mut export = SimExport::new("commute", 42);
        let frame = SimFrame {
            time_sec: 3.0,
            truth: GeoPoint::new(52.0, 4.0),
            fix: None,
            matched: None,
            phase: TrackerPhase::NotStarted,
            active_maneuver: 0,
            cursor_m: 0.0,
            lateral_offset_m: None,
            route_version: 1,
            events: vec![NavEvent::RouteCompleted],
        };
        export.add_frame(frame);
        export.finalize(true, None);

        assert_eq!(export.duration_sec, 3.0);
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["frames"][0]["phase"], "not_started");
        assert_eq!(json["frames"][0]["events"][0]["type"], "route_completed");
        assert!(json.get("failure_reason").is_none());
        assert!(json["frames"][0].get("fix").is_none());
    }
}
