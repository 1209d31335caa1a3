//! The "SHAPE" Engine - Geometry Store
//!
//! Turns an ordered GTFS shape into an immutable, queryable polyline:
//! - consecutive duplicates removed, coordinates validated
//! - haversine cumulative-distance table (one entry per vertex, entry 0 = 0)
//! - nearest-segment projection through an R-tree of segment envelopes
//!
//! Projection math runs in a local equirectangular frame (meters east/north
//! of the first vertex). The frame is linear in lat/lon, so a point
//! interpolated in the frame maps back by interpolating lat/lon directly.

use geo::{HaversineBearing, HaversineDistance, Point};
use nalgebra::Vector2;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use shapenav_env::GeoPoint;

use crate::error::NavError;

/// Mean Earth radius used by the local frame (matches geo's haversine).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Shapes with at most this many segments are scanned linearly; longer
/// shapes are queried through the R-tree. Both paths select identically.
pub const LINEAR_SCAN_MAX_SEGMENTS: usize = 32;

/// Squared-distance window (m²) inside which two segments count as tied.
const TIE_EPSILON_M2: f64 = 1e-9;

/// Haversine distance in meters.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    Point::new(a.lon, a.lat).haversine_distance(&Point::new(b.lon, b.lat))
}

/// Initial bearing from `a` to `b` in degrees, normalised to [0, 360).
pub fn bearing_deg(a: &GeoPoint, b: &GeoPoint) -> f64 {
    Point::new(a.lon, a.lat)
        .haversine_bearing(Point::new(b.lon, b.lat))
        .rem_euclid(360.0)
}

/// Thins a point sequence for planner requests.
///
/// Keeps the first point, then a point only if it is at least `min_step_m`
/// away from the last kept one. The last point is always kept.
pub fn downsample_by_distance(points: &[GeoPoint], min_step_m: f64) -> Vec<GeoPoint> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let mut kept = vec![points[0]];
    let mut last = points[0];
    for p in &points[1..points.len() - 1] {
        if haversine_m(&last, p) >= min_step_m {
            kept.push(*p);
            last = *p;
        }
    }
    kept.push(points[points.len() - 1]);
    kept
}

// ============================================================================
// SPATIAL INDEX ENTRY
// ============================================================================

/// One polyline segment in local-frame meters, stored in the R-tree.
#[derive(Debug, Clone, Copy)]
struct IndexedSegment {
    idx: usize,
    a: [f64; 2],
    b: [f64; 2],
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.a, self.b)
    }
}

impl PointDistance for IndexedSegment {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let a = Vector2::new(self.a[0], self.a[1]);
        let b = Vector2::new(self.b[0], self.b[1]);
        let p = Vector2::new(point[0], point[1]);
        let (_, d2) = closest_on_segment(&a, &b, &p);
        d2
    }
}

/// Clamped perpendicular projection of `p` onto segment `ab`.
///
/// Returns (fraction along the segment in [0, 1], squared distance).
fn closest_on_segment(a: &Vector2<f64>, b: &Vector2<f64>, p: &Vector2<f64>) -> (f64, f64) {
    let v = b - a;
    let w = p - a;
    let len2 = v.norm_squared();
    let t = if len2 <= f64::EPSILON {
        0.0
    } else {
        (w.dot(&v) / len2).clamp(0.0, 1.0)
    };
    let m = a + v * t;
    (t, (p - m).norm_squared())
}

// ============================================================================
// PROJECTION RESULT
// ============================================================================

/// Result of projecting a raw coordinate onto the polyline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Closest point on the polyline
    pub point: GeoPoint,

    /// Index i of the segment (vertex i → vertex i+1)
    pub segment_index: usize,

    /// Position along the segment in [0, 1]
    pub fraction: f64,

    /// Along-route distance from the route start (meters)
    pub cumulative_m: f64,
}

// ============================================================================
// GEOMETRY STORE
// ============================================================================

/// Immutable polyline with cumulative distances and a segment index.
///
/// Built once per route shape and shared read-only between sessions.
pub struct GeometryStore {
    /// Retained vertices (no consecutive duplicates)
    vertices: Vec<GeoPoint>,

    /// cumulative[i] = meters from start to vertex i
    cumulative: Vec<f64>,

    /// Haversine length of each segment
    segment_lengths: Vec<f64>,

    /// Vertices in the local meter frame
    local: Vec<Vector2<f64>>,

    /// Local frame origin (first vertex) and its latitude cosine
    origin: GeoPoint,
    cos_lat0: f64,

    /// Input point index → retained vertex index
    source_to_vertex: Vec<usize>,

    /// Segment R-tree, only for long shapes
    index: Option<RTree<IndexedSegment>>,
}

impl GeometryStore {
    /// Builds the store from an ordered point sequence.
    ///
    /// Fails with `InvalidGeometry` on malformed coordinates or when fewer
    /// than two distinct points remain after removing consecutive duplicates.
    pub fn build(points: &[GeoPoint]) -> Result<Self, NavError> {
        if let Some(i) = points.iter().position(|p| !p.is_valid()) {
            return Err(NavError::InvalidGeometry(format!(
                "point {} is not a valid coordinate: {:?}",
                i, points[i]
            )));
        }

        let mut vertices: Vec<GeoPoint> = Vec::with_capacity(points.len());
        let mut source_to_vertex = Vec::with_capacity(points.len());
        for p in points {
            match vertices.last() {
                Some(last) if last.same_position(p) => {}
                _ => vertices.push(*p),
            }
            source_to_vertex.push(vertices.len().saturating_sub(1));
        }

        if vertices.len() < 2 {
            return Err(NavError::InvalidGeometry(format!(
                "need at least 2 distinct points, got {}",
                vertices.len()
            )));
        }

        let segment_lengths: Vec<f64> = vertices
            .windows(2)
            .map(|w| haversine_m(&w[0], &w[1]))
            .collect();

        let mut cumulative = Vec::with_capacity(vertices.len());
        cumulative.push(0.0);
        for len in &segment_lengths {
            let prev = cumulative[cumulative.len() - 1];
            cumulative.push(prev + len);
        }

        let origin = vertices[0];
        let cos_lat0 = origin.lat.to_radians().cos();
        let local: Vec<Vector2<f64>> = vertices
            .iter()
            .map(|p| to_local(&origin, cos_lat0, p))
            .collect();

        let index = if segment_lengths.len() > LINEAR_SCAN_MAX_SEGMENTS {
            let segments = local
                .windows(2)
                .enumerate()
                .map(|(idx, w)| IndexedSegment {
                    idx,
                    a: [w[0].x, w[0].y],
                    b: [w[1].x, w[1].y],
                })
                .collect();
            Some(RTree::bulk_load(segments))
        } else {
            None
        };

        Ok(Self {
            vertices,
            cumulative,
            segment_lengths,
            local,
            origin,
            cos_lat0,
            source_to_vertex,
            index,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn vertices(&self) -> &[GeoPoint] {
        &self.vertices
    }

    pub fn cumulative(&self) -> &[f64] {
        &self.cumulative
    }

    pub fn segment_count(&self) -> usize {
        self.segment_lengths.len()
    }

    /// Total route length in meters.
    pub fn total_length(&self) -> f64 {
        self.cumulative[self.cumulative.len() - 1]
    }

    /// True when projections go through the R-tree.
    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    /// Retained vertex index for an index into the original input points.
    pub fn vertex_for_source(&self, source_index: usize) -> Option<usize> {
        self.source_to_vertex.get(source_index).copied()
    }

    /// Direction of travel along segment `i`, degrees from north.
    pub fn segment_bearing(&self, i: usize) -> Option<f64> {
        let a = self.vertices.get(i)?;
        let b = self.vertices.get(i + 1)?;
        Some(bearing_deg(a, b))
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Projects a raw coordinate onto the closest segment.
    ///
    /// Ties (within 1e-9 m²) go to the segment with the larger index, since
    /// vehicles move forward along the route far more often than backward.
    /// Pure and deterministic; the store is never mutated.
    pub fn project(&self, raw: &GeoPoint) -> Projection {
        let p = to_local(&self.origin, self.cos_lat0, raw);
        let (segment_index, fraction) = match &self.index {
            Some(tree) => self.nearest_indexed(tree, &p),
            None => self.nearest_linear(&p),
        };
        self.projection_at(segment_index, fraction)
    }

    fn nearest_linear(&self, p: &Vector2<f64>) -> (usize, f64) {
        let candidates: Vec<(usize, f64, f64)> = (0..self.segment_count())
            .map(|i| {
                let (t, d2) = closest_on_segment(&self.local[i], &self.local[i + 1], p);
                (i, t, d2)
            })
            .collect();
        select_forward_biased(&candidates)
    }

    fn nearest_indexed(&self, tree: &RTree<IndexedSegment>, p: &Vector2<f64>) -> (usize, f64) {
        let query = [p.x, p.y];
        let mut candidates: Vec<(usize, f64, f64)> = Vec::new();
        let mut best_d2 = f64::INFINITY;

        // Iterator is sorted by distance; stop once past the tie window.
        for (segment, d2) in tree.nearest_neighbor_iter_with_distance_2(&query) {
            if d2 > best_d2 + TIE_EPSILON_M2 {
                break;
            }
            best_d2 = best_d2.min(d2);
            let (t, _) = closest_on_segment(&self.local[segment.idx], &self.local[segment.idx + 1], p);
            candidates.push((segment.idx, t, d2));
        }

        if candidates.is_empty() {
            return self.nearest_linear(p);
        }
        select_forward_biased(&candidates)
    }

    fn projection_at(&self, segment_index: usize, fraction: f64) -> Projection {
        let a = &self.vertices[segment_index];
        let b = &self.vertices[segment_index + 1];
        let point = if fraction <= 0.0 {
            *a
        } else if fraction >= 1.0 {
            *b
        } else {
            interpolate(a, b, fraction)
        };
        let cumulative_m = (self.cumulative[segment_index]
            + fraction * self.segment_lengths[segment_index])
            .clamp(0.0, self.total_length());

        Projection {
            point,
            segment_index,
            fraction,
            cumulative_m,
        }
    }

    /// The point lying `distance_m` along the route (clamped to the ends).
    pub fn point_at(&self, distance_m: f64) -> Projection {
        let d = if distance_m.is_finite() {
            distance_m.clamp(0.0, self.total_length())
        } else {
            0.0
        };
        let i = self
            .cumulative
            .partition_point(|c| *c <= d)
            .saturating_sub(1)
            .min(self.segment_count() - 1);
        let len = self.segment_lengths[i];
        let fraction = if len > 0.0 {
            ((d - self.cumulative[i]) / len).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.projection_at(i, fraction)
    }

    /// Geometry ahead of `distance_m`: the interpolated point, then every
    /// following vertex up to the route end.
    pub fn remaining_points_from(&self, distance_m: f64) -> Vec<GeoPoint> {
        let here = self.point_at(distance_m);
        let mut points = vec![here.point];
        for v in &self.vertices[here.segment_index + 1..] {
            if !v.same_position(&here.point) {
                points.push(*v);
            }
        }
        points
    }
}

impl std::fmt::Debug for GeometryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryStore")
            .field("vertices", &self.vertices.len())
            .field("total_length_m", &self.total_length())
            .field("indexed", &self.is_indexed())
            .finish()
    }
}

/// Picks the minimum squared distance, ties resolved to the larger index.
fn select_forward_biased(candidates: &[(usize, f64, f64)]) -> (usize, f64) {
    let best_d2 = candidates
        .iter()
        .map(|c| c.2)
        .fold(f64::INFINITY, f64::min);

    candidates
        .iter()
        .filter(|c| c.2 <= best_d2 + TIE_EPSILON_M2)
        .max_by_key(|c| c.0)
        .map(|c| (c.0, c.1))
        .unwrap_or((0, 0.0))
}

fn to_local(origin: &GeoPoint, cos_lat0: f64, p: &GeoPoint) -> Vector2<f64> {
    Vector2::new(
        (p.lon - origin.lon).to_radians() * EARTH_RADIUS_M * cos_lat0,
        (p.lat - origin.lat).to_radians() * EARTH_RADIUS_M,
    )
}

fn interpolate(a: &GeoPoint, b: &GeoPoint, t: f64) -> GeoPoint {
    let alt = match (a.alt, b.alt) {
        (Some(x), Some(y)) => Some(x + (y - x) * t),
        _ => None,
    };
    GeoPoint {
        lat: a.lat + (b.lat - a.lat) * t,
        lon: a.lon + (b.lon - a.lon) * t,
        alt,
    }
}

// ============================================================================
// TESTS
// ============================================================================
