//! Core environment context trait for ShapeNav sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the navigation engine can
/// run in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Simulation**: `SimContext` - manually advanced virtual clock
///
/// # Determinism
///
/// Re-plan cooldowns, backoff deadlines and planner timeouts are all measured
/// against `now()`, so a simulation controls them completely.
#[async_trait]
pub trait NavContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for re-plan scheduling. In simulation, this is the virtual clock.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Only used for diagnostics; fix ordering relies on fix timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// Used for per-session loops and for non-blocking planner calls.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
