//! The "CHECKPOINT" Engine - Maneuver Index
//!
//! Anchors planner maneuvers to along-route distances so the tracker can
//! find the active maneuver with a binary search.

use serde::{Deserialize, Serialize};
use shapenav_env::{Instruction, PlannedManeuver};

use crate::error::NavError;
use crate::shapenav_geometry::GeometryStore;

/// Anchoring parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManeuverConfig {
    /// Minimum spacing forced between consecutive anchors (meters)
    pub anchor_epsilon_m: f64,
}

impl Default for ManeuverConfig {
    fn default() -> Self {
        Self {
            anchor_epsilon_m: 0.05,
        }
    }
}

/// A maneuver pinned to the route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchoredManeuver {
    /// Position in route order (0-based)
    pub ordinal: usize,

    /// Cumulative distance of the maneuver along the route (meters)
    pub anchor_m: f64,

    /// Payload passed through unchanged
    pub instruction: Instruction,
}

/// Ordered, strictly increasing sequence of anchored maneuvers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManeuverIndex {
    maneuvers: Vec<AnchoredManeuver>,
}

impl ManeuverIndex {
    /// Anchors `planned` onto `store`.
    ///
    /// `shape_index` (an index into the points that produced `store`) wins
    /// over `position`; a maneuver carrying neither lands just after its
    /// predecessor. Out-of-order or tied anchors are clamped forward by
    /// `anchor_epsilon_m` instead of being rejected.
    pub fn build(
        store: &GeometryStore,
        planned: &[PlannedManeuver],
        config: &ManeuverConfig,
    ) -> Result<Self, NavError> {
        if planned.is_empty() {
            return Err(NavError::EmptyManeuverList);
        }

        let eps = config.anchor_epsilon_m.max(f64::EPSILON);
        let mut maneuvers: Vec<AnchoredManeuver> = Vec::with_capacity(planned.len());

        for (ordinal, m) in planned.iter().enumerate() {
            let raw = resolve_anchor(store, m);
            let anchor_m = match maneuvers.last() {
                // The first maneuver always marks the route start.
                None => 0.0,
                Some(prev) => match raw {
                    Some(d) if d > prev.anchor_m => d,
                    _ => prev.anchor_m + eps,
                },
            };

            maneuvers.push(AnchoredManeuver {
                ordinal,
                anchor_m,
                instruction: m.instruction.clone(),
            });
        }

        Ok(Self { maneuvers })
    }

    /// Greatest ordinal whose anchor is ≤ `distance_m`, or 0 when the
    /// distance precedes every anchor.
    pub fn find_active(&self, distance_m: f64) -> usize {
        self.maneuvers
            .partition_point(|m| m.anchor_m <= distance_m)
            .saturating_sub(1)
    }

    /// The maneuver following `ordinal`, if any.
    pub fn next_after(&self, ordinal: usize) -> Option<&AnchoredManeuver> {
        self.maneuvers.get(ordinal + 1)
    }

    pub fn get(&self, ordinal: usize) -> Option<&AnchoredManeuver> {
        self.maneuvers.get(ordinal)
    }

    pub fn anchor(&self, ordinal: usize) -> Option<f64> {
        self.maneuvers.get(ordinal).map(|m| m.anchor_m)
    }

    pub fn last_ordinal(&self) -> usize {
        self.maneuvers.len() - 1
    }

    /// Anchor of the final maneuver.
    pub fn final_anchor(&self) -> f64 {
        self.maneuvers[self.maneuvers.len() - 1].anchor_m
    }

    pub fn len(&self) -> usize {
        self.maneuvers.len()
    }

    /// Always false; an index holds at least one maneuver.
    pub fn is_empty(&self) -> bool {
        self.maneuvers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnchoredManeuver> {
        self.maneuvers.iter()
    }
}

fn resolve_anchor(store: &GeometryStore, m: &PlannedManeuver) -> Option<f64> {
    if let Some(vertex) = m.shape_index.and_then(|i| store.vertex_for_source(i)) {
        return Some(store.cumulative()[vertex]);
    }
    m.position
        .filter(|p| p.is_valid())
        .map(|p| store.project(&p).cumulative_m)
}

// ============================================================================
// TESTS
// ============================================================================
