//! ShapeNav Core - Live Map-Matching & Maneuver-Tracking Engine
//!
//! Tracks moving vehicles against static transit route shapes:
//! 1. **Shape Problem**: nearest-segment projection on long polylines via a segment R-tree
//! 2. **Checkpoint Problem**: planner maneuvers anchored to monotonic along-route offsets
//! 3. **Noise Problem**: forward-only progress cursor that holds through GPS regressions
//! 4. **Drift Problem**: windowed deviation detection with rate-limited re-plan requests
//!
//! Route geometry is built once per shape and shared read-only between
//! sessions; each session processes its own fixes strictly in order.

pub mod config;
pub mod error;
pub mod route_registry;
pub mod session;
pub mod session_runtime;
pub mod shapenav_deviation;
pub mod shapenav_geometry;
pub mod shapenav_maneuvers;
pub mod shapenav_matcher;
pub mod shapenav_progress;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use config::{EngineConfig, RuntimeConfig};
pub use error::NavError;
pub use route_registry::{RouteRegistry, RouteShape};
pub use session::{NavEvent, NavSession, NavigationState, ReplanCommand, SessionStep};
pub use session_runtime::{SessionHandle, SessionInput, SessionRuntime, SessionUpdate};
pub use shapenav_deviation::{
    DeviationConfig, DeviationMonitor, DeviationSignal, ReplanPolicy, ReplanScheduler, ReplanState,
};
pub use shapenav_geometry::{downsample_by_distance, GeometryStore, Projection};
pub use shapenav_maneuvers::{AnchoredManeuver, ManeuverConfig, ManeuverIndex};
pub use shapenav_matcher::{Fix, MatchQuality, MatchedPoint, Matcher, MatcherConfig};
pub use shapenav_progress::{ProgressConfig, ProgressTracker, ProgressUpdate, TrackerPhase};
