//! Shared route geometry.
//!
//! A `RouteShape` bundles the Geometry Store and Maneuver Index for one
//! shape. The registry hands out `Arc`s to them; reload swaps the `Arc`
//! under a short write lock, so sessions holding the previous version keep
//! reading it unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use shapenav_env::{GeoPoint, ManeuverPlanner, PlanRequest, PlannedManeuver, ShapeId};
use tracing::{info, warn};

use crate::error::NavError;
use crate::shapenav_geometry::{downsample_by_distance, GeometryStore};
use crate::shapenav_maneuvers::{ManeuverConfig, ManeuverIndex};

/// Immutable, shareable route: geometry plus anchored maneuvers.
#[derive(Debug)]
pub struct RouteShape {
    shape_id: ShapeId,
    version: u64,
    geometry: GeometryStore,
    maneuvers: ManeuverIndex,
}

impl RouteShape {
    /// Builds geometry then anchors maneuvers; either step may fail fatally.
    pub fn build(
        shape_id: ShapeId,
        version: u64,
        points: &[GeoPoint],
        planned: &[PlannedManeuver],
        config: &ManeuverConfig,
    ) -> Result<Self, NavError> {
        let geometry = GeometryStore::build(points)?;
        let maneuvers = ManeuverIndex::build(&geometry, planned, config)?;
        Ok(Self {
            shape_id,
            version,
            geometry,
            maneuvers,
        })
    }

    pub fn shape_id(&self) -> &ShapeId {
        &self.shape_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn geometry(&self) -> &GeometryStore {
        &self.geometry
    }

    pub fn maneuvers(&self) -> &ManeuverIndex {
        &self.maneuvers
    }

    /// Distance at which the route counts as driven to the end.
    pub fn completion_target_m(&self) -> f64 {
        self.maneuvers.final_anchor().max(self.geometry.total_length())
    }
}

/// Rewrites shape indices into positions taken from `basis`.
///
/// Planner shape indices refer to the geometry the planner saw (or
/// returned); when the route is built on different points, only the
/// position is meaningful.
pub(crate) fn rebase_maneuvers(basis: &[GeoPoint], planned: &[PlannedManeuver]) -> Vec<PlannedManeuver> {
    planned
        .iter()
        .map(|m| match m.shape_index.and_then(|i| basis.get(i)) {
            Some(p) => PlannedManeuver::at_position(*p, m.instruction.clone()),
            None => PlannedManeuver {
                shape_index: None,
                ..m.clone()
            },
        })
        .collect()
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Process-wide map of loaded shapes.
#[derive(Debug)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<ShapeId, Arc<RouteShape>>>,

    /// Versions are unique and increasing (not contiguous)
    next_version: AtomicU64,

    maneuver_config: ManeuverConfig,
}

impl RouteRegistry {
    pub fn new(maneuver_config: ManeuverConfig) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            maneuver_config,
        }
    }

    pub fn shared(maneuver_config: ManeuverConfig) -> Arc<Self> {
        Arc::new(Self::new(maneuver_config))
    }

    pub fn maneuver_config(&self) -> &ManeuverConfig {
        &self.maneuver_config
    }

    /// Builds and publishes a shape with a known maneuver list.
    ///
    /// On failure the previously published version (if any) stays in place.
    pub fn load(
        &self,
        shape_id: ShapeId,
        points: &[GeoPoint],
        planned: &[PlannedManeuver],
    ) -> Result<Arc<RouteShape>, NavError> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let route = match RouteShape::build(shape_id.clone(), version, points, planned, &self.maneuver_config) {
            Ok(route) => Arc::new(route),
            Err(e) => {
                warn!("Shape {} rejected: {}", shape_id, e);
                return Err(e);
            }
        };

        let previous = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shape_id.clone(), route.clone());

        info!(
            "Shape {} loaded as v{} ({:.0} m, {} maneuvers{})",
            shape_id,
            version,
            route.geometry().total_length(),
            route.maneuvers().len(),
            previous.map_or(String::new(), |p| format!(", replaces v{}", p.version()))
        );
        Ok(route)
    }

    /// Asks `planner` for maneuvers along `points`, then loads the shape.
    ///
    /// The request carries `points` thinned to `min_step_m`; the route itself
    /// is built on the full-resolution points.
    pub async fn load_with_planner<P: ManeuverPlanner + ?Sized>(
        &self,
        planner: &P,
        shape_id: ShapeId,
        points: &[GeoPoint],
        costing: &str,
        min_step_m: f64,
    ) -> Result<Arc<RouteShape>, NavError> {
        let request = PlanRequest {
            shape_id: shape_id.clone(),
            points: downsample_by_distance(points, min_step_m),
            costing: costing.to_string(),
        };

        let response = planner.plan(request.clone()).await.map_err(|e| {
            warn!("Planner {} failed for shape {}: {}", planner.name(), shape_id, e);
            NavError::PlannerUnavailable(e.to_string())
        })?;

        let basis = if response.geometry.is_empty() {
            &request.points
        } else {
            &response.geometry
        };
        let planned = rebase_maneuvers(basis, &response.maneuvers);
        self.load(shape_id, points, &planned)
    }

    pub fn get(&self, shape_id: &ShapeId) -> Option<Arc<RouteShape>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(shape_id)
            .cloned()
    }

    pub fn remove(&self, shape_id: &ShapeId) -> Option<Arc<RouteShape>> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(shape_id)
    }

    /// Loaded shape ids, sorted.
    pub fn shape_ids(&self) -> Vec<ShapeId> {
        let mut ids: Vec<ShapeId> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new(ManeuverConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
