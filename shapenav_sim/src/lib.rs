//! ShapeNav Deterministic Simulation Harness
//!
//! Drives the navigation engine with simulated vehicles, a simulated
//! maneuver planner and a virtual clock, so that a whole trip (noise,
//! detours, planner outages, reordered delivery) replays bit-for-bit from
//! a single 64-bit seed.
//!
//! # Sources of non-determinism
//!
//! - **Time**: [`SimContext`] owns a virtual clock that only moves when the
//!   runner advances it
//! - **Receiver**: [`Oracle`] drives a vehicle along a path and produces
//!   noisy fixes from a seeded RNG
//! - **Transport**: [`FaultyTransport`] reorders and duplicates fixes from
//!   its own seed
//! - **Planner**: [`SimPlanner`] answers from registered streets, with
//!   injectable failures and latency
//!
//! # Architecture
//!
//! ```text
//!   Oracle ──fix──▶ FaultyTransport ──▶ NavSession / SessionRuntime
//!     ▲                                     │            │
//!     │ path                       ReplanCommand     NavigationState
//!     │                                     ▼            ▼
//!  ScenarioRunner ◀──────────────────── SimPlanner    SimExport
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use shapenav_sim::ScenarioRunner;
//! use shapenav_sim::scenarios::ScenarioId;
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Detour);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod oracle;
mod planner;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{SimExport, SimFrame};
pub use oracle::{l_route, polyline, with_detour, Detour, FaultyTransport, LocalFrame, Oracle};
pub use planner::{derive_maneuvers, SimPlanner};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
