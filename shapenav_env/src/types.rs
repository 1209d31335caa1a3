//! Common types shared between the engine and its collaborators.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a tracked vehicle/trip session.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a SessionId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic SessionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of a route shape (the GTFS `shape_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeId(pub String);

impl ShapeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShapeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ShapeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A WGS84 coordinate in degrees, with optional altitude in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, alt: None }
    }

    pub const fn with_altitude(lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            lat,
            lon,
            alt: Some(alt),
        }
    }

    /// True when both coordinates are finite and inside the WGS84 range.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
            && self.alt.map_or(true, f64::is_finite)
    }

    /// Horizontal equality (altitude ignored).
    pub fn same_position(&self, other: &GeoPoint) -> bool {
        self.lat == other.lat && self.lon == other.lon
    }
}

/// Coarse maneuver category reported by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverKind {
    Start,
    Straight,
    Left,
    Right,
    Uturn,
    Merge,
    Exit,
    Roundabout,
    Arrive,
    Unknown,
}

impl ManeuverKind {
    /// Classifies free-form planner instruction text by keyword.
    ///
    /// Keyword matching is stable across router versions where numeric
    /// maneuver type codes are not. Order matters: "roundabout" instructions
    /// usually also say "right"/"left", and "u-turn" says "left".
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["roundabout", "rotonde"]) {
            ManeuverKind::Roundabout
        } else if has(&["arrive", "bestemming"]) {
            ManeuverKind::Arrive
        } else if has(&["u-turn", "keer om"]) {
            ManeuverKind::Uturn
        } else if has(&["left", "links"]) {
            ManeuverKind::Left
        } else if has(&["right", "rechts"]) {
            ManeuverKind::Right
        } else if has(&["merge", "voeg"]) {
            ManeuverKind::Merge
        } else if has(&["exit", "afrit"]) {
            ManeuverKind::Exit
        } else if has(&["start"]) {
            ManeuverKind::Start
        } else if has(&["straight", "rechtdoor"]) {
            ManeuverKind::Straight
        } else {
            ManeuverKind::Unknown
        }
    }
}

/// Instruction payload attached to a maneuver.
///
/// The engine never interprets it; it is handed to the state consumer as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: ManeuverKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roundabout_exit: Option<u32>,
}

impl Instruction {
    pub fn new(kind: ManeuverKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            roundabout_exit: None,
        }
    }

    /// Builds an instruction from text alone, classifying its kind.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: ManeuverKind::classify(&text),
            text,
            roundabout_exit: None,
        }
    }
}

/// One maneuver as returned by the planner, before anchoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedManeuver {
    /// Approximate geographic position of the maneuver
    #[serde(default)]
    pub position: Option<GeoPoint>,

    /// Index into the request/response geometry where the maneuver begins
    #[serde(default)]
    pub shape_index: Option<usize>,

    /// Opaque instruction payload
    pub instruction: Instruction,
}

impl PlannedManeuver {
    pub fn at_position(position: GeoPoint, instruction: Instruction) -> Self {
        Self {
            position: Some(position),
            shape_index: None,
            instruction,
        }
    }

    pub fn at_shape_index(shape_index: usize, instruction: Instruction) -> Self {
        Self {
            position: None,
            shape_index: Some(shape_index),
            instruction,
        }
    }
}

/// Request sent to the maneuver planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    /// Shape the request is for
    pub shape_id: ShapeId,

    /// Ordered geometry to plan along (already downsampled)
    pub points: Vec<GeoPoint>,

    /// Router costing model (e.g. "bus", "auto")
    pub costing: String,
}

/// Planner response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanResponse {
    /// Matched route geometry. Empty means "use the request points".
    #[serde(default)]
    pub geometry: Vec<GeoPoint>,

    /// Ordered maneuvers
    pub maneuvers: Vec<PlannedManeuver>,

    /// Total length reported by the planner, informational only
    #[serde(default)]
    pub total_distance_m: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_seed_is_deterministic() {
        assert_eq!(SessionId::from_seed(7), SessionId::from_seed(7));
        assert_ne!(SessionId::from_seed(7), SessionId::from_seed(8));
    }

    #[test]
    fn test_geo_point_validity() {
        assert!(GeoPoint::new(52.37, 4.89).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 4.89).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::with_altitude(0.0, 0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_classify_instruction_text() {
        assert_eq!(ManeuverKind::classify("Turn left onto Damrak."), ManeuverKind::Left);
        assert_eq!(ManeuverKind::classify("Sla rechts af"), ManeuverKind::Right);
        assert_eq!(
            ManeuverKind::classify("Enter the roundabout and take the 2nd exit"),
            ManeuverKind::Roundabout
        );
        assert_eq!(ManeuverKind::classify("Make a left U-turn"), ManeuverKind::Uturn);
        assert_eq!(ManeuverKind::classify("You have arrived"), ManeuverKind::Arrive);
        assert_eq!(ManeuverKind::classify("Drive north."), ManeuverKind::Unknown);
    }

    #[test]
    fn test_plan_response_deserializes_without_geometry() {
        let json = r#"{"maneuvers":[{"shape_index":0,"instruction":{"kind":"start","text":"Drive east."}}]}"#;
        let response: PlanResponse = serde_json::from_str(json).unwrap();
        assert!(response.geometry.is_empty());
        assert_eq!(response.maneuvers[0].shape_index, Some(0));
        assert_eq!(response.maneuvers[0].instruction.kind, ManeuverKind::Start);
    }
}
