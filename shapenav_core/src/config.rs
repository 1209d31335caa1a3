//! Engine configuration.
//!
//! Every section has defaults; a JSON document only needs the keys it
//! overrides.

use serde::{Deserialize, Serialize};

use crate::error::NavError;
use crate::shapenav_deviation::{DeviationConfig, ReplanPolicy};
use crate::shapenav_maneuvers::ManeuverConfig;
use crate::shapenav_matcher::MatcherConfig;
use crate::shapenav_progress::ProgressConfig;

/// Session task and planner request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Session wake-up interval for re-plan retries without fresh fixes
    pub tick_interval_ms: u64,

    /// Bounded input queue per session
    pub queue_capacity: usize,

    /// Spacing used to thin planner request geometry (meters)
    pub request_min_step_m: f64,

    /// Router costing model sent with every request
    pub costing: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            queue_capacity: 256,
            request_min_step_m: 15.0,
            costing: "bus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub matcher: MatcherConfig,
    pub progress: ProgressConfig,
    pub deviation: DeviationConfig,
    pub replan: ReplanPolicy,
    pub runtime: RuntimeConfig,
    pub maneuvers: ManeuverConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON override document.
    pub fn from_json_str(json: &str) -> Result<Self, NavError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| NavError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NavError> {
        let fail = |msg: &str| Err(NavError::InvalidConfig(msg.to_string()));

        let m = &self.matcher;
        if !(m.accuracy_multiplier.is_finite() && m.accuracy_multiplier >= 0.0) {
            return fail("matcher.accuracy_multiplier must be >= 0");
        }
        if !(m.min_tolerance_m.is_finite() && m.min_tolerance_m >= 0.0) {
            return fail("matcher.min_tolerance_m must be >= 0");
        }
        if !(0.0..=180.0).contains(&m.heading_threshold_deg) {
            return fail("matcher.heading_threshold_deg must be within [0, 180]");
        }

        let p = &self.progress;
        if !(p.backward_tolerance_m.is_finite() && p.backward_tolerance_m >= 0.0) {
            return fail("progress.backward_tolerance_m must be >= 0");
        }
        if !(p.completion_tolerance_m.is_finite() && p.completion_tolerance_m >= 0.0) {
            return fail("progress.completion_tolerance_m must be >= 0");
        }
        if p.completion_confirmations == 0 {
            return fail("progress.completion_confirmations must be >= 1");
        }

        let d = &self.deviation;
        if d.window_size == 0 {
            return fail("deviation.window_size must be >= 1");
        }
        if d.min_samples == 0 || d.min_samples > d.window_size {
            return fail("deviation.min_samples must be within [1, window_size]");
        }
        if !(0.0..1.0).contains(&d.deviation_fraction) || !(0.0..1.0).contains(&d.recovery_fraction) {
            return fail("deviation fractions must be within [0, 1)");
        }
        if !(d.deviation_distance_m.is_finite() && d.deviation_distance_m >= 0.0) {
            return fail("deviation.deviation_distance_m must be >= 0");
        }

        let r = &self.replan;
        if r.initial_backoff_ms > r.max_backoff_ms {
            return fail("replan.initial_backoff_ms must not exceed max_backoff_ms");
        }
        if r.request_timeout_ms == 0 {
            return fail("replan.request_timeout_ms must be > 0");
        }
        if r.max_attempts_per_episode == Some(0) {
            return fail("replan.max_attempts_per_episode must be >= 1 when set");
        }

        let rt = &self.runtime;
        if rt.tick_interval_ms == 0 || rt.queue_capacity == 0 {
            return fail("runtime.tick_interval_ms and queue_capacity must be > 0");
        }
        if !(rt.request_min_step_m.is_finite() && rt.request_min_step_m >= 0.0) {
            return fail("runtime.request_min_step_m must be >= 0");
        }

        if !(self.maneuvers.anchor_epsilon_m.is_finite() && self.maneuvers.anchor_epsilon_m > 0.0) {
            return fail("maneuvers.anchor_epsilon_m must be > 0");
        }

        Ok(())
    }
}
