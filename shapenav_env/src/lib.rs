//! ShapeNav Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary that lets the ShapeNav engine
//! run against **Production** (tokio + a real routing service) and
//! **Simulation** (virtual clock + scripted planner) environments.
//!
//! # Core Concept
//!
//! The navigation engine never touches a clock, a task scheduler or the
//! network directly. Everything that would introduce non-determinism goes
//! through two traits:
//! - [`NavContext`]: time (`now()`, `sleep()`) and task spawning
//! - [`ManeuverPlanner`]: the external routing / maneuver-generation service
//!
//! # Example
//!
//! ```ignore
//! use shapenav_env::{NavContext, ManeuverPlanner, PlanRequest};
//!
//! async fn replan<Ctx: NavContext, P: ManeuverPlanner>(ctx: &Ctx, planner: &P, req: PlanRequest) {
//!     tokio::select! {
//!         response = planner.plan(req) => handle(response),
//!         _ = ctx.sleep(Duration::from_secs(10)) => timed_out(),
//!     }
//! }
//! ```

mod context;
mod planner;
mod types;
mod error;
mod tokio_impl;

pub use context::NavContext;
pub use planner::{ManeuverPlanner, PlannerController};
pub use types::{
    GeoPoint, Instruction, ManeuverKind, PlanRequest, PlanResponse, PlannedManeuver, SessionId,
    ShapeId,
};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
