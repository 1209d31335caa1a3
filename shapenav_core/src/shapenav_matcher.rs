//! The "SNAP" Engine - Matcher
//!
//! Projects a raw GPS fix onto the route geometry and grades how much the
//! projection can be trusted. The matcher never rejects a fix for being far
//! from the route; deciding "off route" belongs to the deviation monitor.

use serde::{Deserialize, Serialize};
use shapenav_env::GeoPoint;

use crate::error::NavError;
use crate::shapenav_geometry::{haversine_m, GeometryStore};

/// Matcher tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Multiplier k applied to the reported horizontal accuracy
    pub accuracy_multiplier: f64,

    /// Lower bound of the Good tolerance, whatever the accuracy says (meters)
    pub min_tolerance_m: f64,

    /// Heading disagreement that downgrades quality one level (degrees)
    pub heading_threshold_deg: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            accuracy_multiplier: 2.0,
            min_tolerance_m: 15.0,
            heading_threshold_deg: 60.0,
        }
    }
}

// ============================================================================
// INPUT
// ============================================================================

/// One timestamped position observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub position: GeoPoint,

    /// Horizontal accuracy estimate (meters, 1-sigma as reported)
    pub accuracy_m: f64,

    /// Direction of travel, degrees clockwise from north
    #[serde(default)]
    pub heading_deg: Option<f64>,

    /// Observation time (ms since the transport's epoch)
    pub timestamp_ms: u64,
}

impl Fix {
    pub fn new(position: GeoPoint, accuracy_m: f64, timestamp_ms: u64) -> Self {
        Self {
            position,
            accuracy_m,
            heading_deg: None,
            timestamp_ms,
        }
    }

    pub fn with_heading(mut self, heading_deg: f64) -> Self {
        self.heading_deg = Some(heading_deg);
        self
    }

    /// Checks the fix and returns a copy with the heading normalised to
    /// [0, 360).
    pub fn validate(&self) -> Result<Fix, NavError> {
        if !self.position.is_valid() {
            return Err(NavError::InvalidFix(format!(
                "coordinate out of range: ({}, {})",
                self.position.lat, self.position.lon
            )));
        }
        if !self.accuracy_m.is_finite() || self.accuracy_m < 0.0 {
            return Err(NavError::InvalidFix(format!(
                "accuracy must be a non-negative number, got {}",
                self.accuracy_m
            )));
        }
        let heading_deg = match self.heading_deg {
            Some(h) if !h.is_finite() => {
                return Err(NavError::InvalidFix(format!("heading is not finite: {}", h)));
            }
            Some(h) => Some(h.rem_euclid(360.0)),
            None => None,
        };
        Ok(Fix {
            heading_deg,
            ..*self
        })
    }

    /// Duplicate delivery: same timestamp and same coordinate.
    pub fn is_duplicate_of(&self, other: &Fix) -> bool {
        self.timestamp_ms == other.timestamp_ms && self.position.same_position(&other.position)
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Trust level of a projection. Ordered `Bad < Poor < Good`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    /// Poor with a disagreeing heading
    Bad,
    Poor,
    Good,
}

impl MatchQuality {
    fn downgrade(self) -> Self {
        match self {
            MatchQuality::Good => MatchQuality::Poor,
            MatchQuality::Poor | MatchQuality::Bad => MatchQuality::Bad,
        }
    }

    pub fn is_good(self) -> bool {
        self == MatchQuality::Good
    }
}

/// A fix projected onto the route. Created per fix, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPoint {
    /// Closest point on the polyline
    pub point: GeoPoint,

    pub segment_index: usize,

    /// Along-route distance of `point` (meters)
    pub cumulative_m: f64,

    /// Distance between the raw fix and `point` (meters)
    pub lateral_offset_m: f64,

    pub quality: MatchQuality,

    /// Angle between fix heading and segment direction, when a heading was given
    pub heading_delta_deg: Option<f64>,
}

// ============================================================================
// MATCHER
// ============================================================================

/// Stateless fix-to-route projector.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Good tolerance for a given accuracy estimate.
    pub fn tolerance_m(&self, accuracy_m: f64) -> f64 {
        (accuracy_m * self.config.accuracy_multiplier).max(self.config.min_tolerance_m)
    }

    /// Projects a validated fix onto `store`.
    pub fn match_fix(&self, store: &GeometryStore, fix: &Fix) -> MatchedPoint {
        let projection = store.project(&fix.position);
        let lateral_offset_m = haversine_m(&fix.position, &projection.point);

        let mut quality = if lateral_offset_m <= self.tolerance_m(fix.accuracy_m) {
            MatchQuality::Good
        } else {
            MatchQuality::Poor
        };

        let heading_delta_deg = match (fix.heading_deg, store.segment_bearing(projection.segment_index)) {
            (Some(heading), Some(bearing)) => Some(angle_between(heading, bearing)),
            _ => None,
        };
        if heading_delta_deg.map_or(false, |d| d > self.config.heading_threshold_deg) {
            quality = quality.downgrade();
        }

        MatchedPoint {
            point: projection.point,
            segment_index: projection.segment_index,
            cumulative_m: projection.cumulative_m,
            lateral_offset_m,
            quality,
            heading_delta_deg,
        }
    }
}

/// Smallest absolute difference between two bearings, in [0, 180].
pub fn angle_between(a_deg: f64, b_deg: f64) -> f64 {
    let d = (a_deg - b_deg).rem_euclid(360.0);
    if d > 180.0 {
        360.0 - d
    } else {
        d
    }
}

// ============================================================================
// TESTS
// ============================================================================
