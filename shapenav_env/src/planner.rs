//! Maneuver planner abstraction (the external routing service).

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{PlanRequest, PlanResponse};

/// Abstraction for the remote turn-by-turn planner.
///
/// # Implementations
///
/// - **Production**: an HTTP client for a map-matching router
/// - **Simulation**: `SimPlanner`, scripted with configurable latency/outages
///
/// # Request Flow
///
/// ```text
/// Session                    Planner                    Session queue
///   |                           |                            |
///   |-- plan(request) --------->|                            |
///   |   (spawned, non-blocking) |-- [latency / failure] ---->|
///   |                           |                            |-- PlanReady
/// ```
#[async_trait]
pub trait ManeuverPlanner: Send + Sync + 'static {
    /// Requests an ordered maneuver list for the given shape geometry.
    ///
    /// # Returns
    /// * `Ok(PlanResponse)` - maneuvers (possibly with a matched geometry)
    /// * `Err(EnvError)` - transport failure, rejection or timeout
    ///
    /// An empty maneuver list is a valid response at this layer; the engine
    /// decides that it is unusable.
    async fn plan(&self, request: PlanRequest) -> Result<PlanResponse, EnvError>;

    /// Human-readable planner name for logs.
    fn name(&self) -> &str;
}

/// Marker trait for planner fault injection in simulation.
pub trait PlannerController: Send + Sync {
    /// Makes the next `count` requests fail.
    fn fail_next(&self, count: u32);

    /// Sets the simulated response latency.
    fn set_latency_ms(&self, latency_ms: u64);

    /// Clears all injected faults.
    fn heal(&self);
}
