//! Error taxonomy of the navigation engine.

use shapenav_env::{SessionId, ShapeId};

/// Errors that can occur while loading routes or tracking sessions.
///
/// Only `InvalidGeometry` and `EmptyManeuverList` are fatal (to one shape);
/// everything else is recovered locally by the session that produced it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NavError {
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Maneuver list is empty")]
    EmptyManeuverList,

    #[error("Invalid fix: {0}")]
    InvalidFix(String),

    #[error("Planner unavailable: {0}")]
    PlannerUnavailable(String),

    #[error("Stale fix at {timestamp_ms}ms (last accepted {last_accepted_ms}ms)")]
    StaleFix { timestamp_ms: u64, last_accepted_ms: u64 },

    #[error("Shape not loaded: {0}")]
    UnknownShape(ShapeId),

    #[error("Session not found: {0}")]
    UnknownSession(SessionId),

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NavError {
    /// True for errors that make a whole shape unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NavError::InvalidGeometry(_) | NavError::EmptyManeuverList)
    }

    /// True for errors that are dropped without surfacing to the consumer.
    pub fn is_silent(&self) -> bool {
        matches!(self, NavError::StaleFix { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(NavError::InvalidGeometry("too short".into()).is_fatal());
        assert!(NavError::EmptyManeuverList.is_fatal());
        assert!(!NavError::InvalidFix("NaN".into()).is_fatal());
        assert!(!NavError::PlannerUnavailable("down".into()).is_fatal());
        assert!(NavError::StaleFix { timestamp_ms: 1, last_accepted_ms: 2 }.is_silent());
    }
}
