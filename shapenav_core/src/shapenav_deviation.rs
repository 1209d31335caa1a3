//! The "DRIFT" Engine - Deviation Monitor and Re-plan Scheduler
//!
//! The monitor watches a sliding window of match qualities and lateral
//! offsets and decides when the vehicle has left (or rejoined) the route.
//!
//! The scheduler turns deviation episodes into a bounded stream of planner
//! requests: one request per episode, re-issued only after a cooldown and
//! with exponential backoff on failure. Responses are matched by request id
//! so late or superseded answers are dropped.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::shapenav_matcher::{MatchQuality, MatchedPoint};

// ============================================================================
// DEVIATION MONITOR
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviationConfig {
    /// Number of recent matches kept
    pub window_size: usize,

    /// No decision before this many samples
    pub min_samples: usize,

    /// Share of non-Good samples above which deviation is possible
    pub deviation_fraction: f64,

    /// Mean lateral offset above which deviation is possible (meters)
    pub deviation_distance_m: f64,

    /// Share of Good samples above which a deviation ends
    pub recovery_fraction: f64,
}

impl Default for DeviationConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            min_samples: 4,
            deviation_fraction: 0.5,
            deviation_distance_m: 50.0,
            recovery_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DeviationSignal {
    None,
    Deviated { mean_offset_m: f64 },
    Recovered,
}

#[derive(Debug, Clone)]
pub struct DeviationMonitor {
    config: DeviationConfig,
    window: VecDeque<(MatchQuality, f64)>,
    deviated: bool,
}

impl DeviationMonitor {
    pub fn new(config: DeviationConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            deviated: false,
        }
    }

    pub fn is_deviated(&self) -> bool {
        self.deviated
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Mean lateral offset over the window (0 when empty).
    pub fn mean_offset_m(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|(_, o)| o).sum::<f64>() / self.window.len() as f64
    }

    /// Adds one sample and reports a state change, if any.
    ///
    /// Each call returns at most one signal, and `Deviated`/`Recovered`
    /// strictly alternate.
    pub fn observe(&mut self, matched: &MatchedPoint) -> DeviationSignal {
        if self.window.len() == self.config.window_size.max(1) {
            self.window.pop_front();
        }
        self.window.push_back((matched.quality, matched.lateral_offset_m));

        let n = self.window.len();
        if n < self.config.min_samples.max(1) {
            return DeviationSignal::None;
        }

        let good = self.window.iter().filter(|(q, _)| q.is_good()).count();
        let good_share = good as f64 / n as f64;
        let poor_share = (n - good) as f64 / n as f64;

        if !self.deviated {
            let mean = self.mean_offset_m();
            if poor_share > self.config.deviation_fraction && mean > self.config.deviation_distance_m {
                self.deviated = true;
                return DeviationSignal::Deviated { mean_offset_m: mean };
            }
        } else if good_share > self.config.recovery_fraction {
            self.deviated = false;
            return DeviationSignal::Recovered;
        }

        DeviationSignal::None
    }

    /// Clears the window, e.g. when tracking starts on a new route.
    pub fn reset(&mut self) {
        self.window.clear();
        self.deviated = false;
    }
}

// ============================================================================
// RE-PLAN SCHEDULER
// ============================================================================

/// Rate limits for planner requests. Times are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanPolicy {
    /// Episodes are counted from 1. Episode `n` waits one cooldown before
    /// its first request while `n < episodes_before_replan`; from episode
    /// `episodes_before_replan` on, the first request goes out at once.
    /// 0 and 1 both mean "request at once".
    pub episodes_before_replan: u32,

    /// Minimum spacing between two requests of the same episode
    pub cooldown_ms: u64,

    /// First failure backoff, doubled on each further failure
    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// A request without an answer after this long counts as failed
    pub request_timeout_ms: u64,

    /// Give up on an episode after this many requests
    pub max_attempts_per_episode: Option<u32>,
}

impl Default for ReplanPolicy {
    fn default() -> Self {
        Self {
            episodes_before_replan: 1,
            cooldown_ms: 30_000,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            request_timeout_ms: 10_000,
            max_attempts_per_episode: None,
        }
    }
}

impl ReplanPolicy {
    /// Backoff after `failures` consecutive failures (1-based).
    pub fn backoff_ms(&self, failures: u32) -> u64 {
        let shift = failures.saturating_sub(1).min(32);
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplanState {
    /// No deviation episode open
    Idle,
    /// Episode open, next request allowed at `retry_at_ms`
    Waiting { retry_at_ms: u64 },
    /// A request is outstanding
    InFlight { request_id: u64, issued_at_ms: u64 },
    /// Attempt budget for this episode used up
    Exhausted,
}

/// Permission to send one planner request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplanTicket {
    pub request_id: u64,
    /// 1-based attempt number within the episode
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct ReplanScheduler {
    policy: ReplanPolicy,
    state: ReplanState,
    episodes: u32,
    attempts: u32,
    failures: u32,
    last_issue_ms: Option<u64>,
    next_request_id: u64,
}

impl ReplanScheduler {
    pub fn new(policy: ReplanPolicy) -> Self {
        Self {
            policy,
            state: ReplanState::Idle,
            episodes: 0,
            attempts: 0,
            failures: 0,
            last_issue_ms: None,
            next_request_id: 1,
        }
    }

    pub fn state(&self) -> ReplanState {
        self.state
    }

    pub fn policy(&self) -> &ReplanPolicy {
        &self.policy
    }

    /// Deviation episodes seen so far.
    pub fn episodes(&self) -> u32 {
        self.episodes
    }

    pub fn in_flight(&self) -> Option<u64> {
        match self.state {
            ReplanState::InFlight { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Opens a deviation episode.
    pub fn begin_episode(&mut self, now_ms: u64) {
        self.episodes += 1;
        self.attempts = 0;
        self.failures = 0;
        self.last_issue_ms = None;

        let retry_at_ms = if self.episodes < self.policy.episodes_before_replan {
            now_ms.saturating_add(self.policy.cooldown_ms)
        } else {
            now_ms
        };
        debug!("Deviation episode {} opened, first request at {}ms", self.episodes, retry_at_ms);
        self.state = ReplanState::Waiting { retry_at_ms };
    }

    /// Closes the episode; an outstanding request becomes stale.
    pub fn end_episode(&mut self) {
        if let Some(request_id) = self.in_flight() {
            debug!("Request {} superseded by recovery", request_id);
        }
        self.state = ReplanState::Idle;
    }

    /// Returns the id of an in-flight request that has outlived the
    /// timeout, moving the scheduler into backoff.
    pub fn expire(&mut self, now_ms: u64) -> Option<u64> {
        match self.state {
            ReplanState::InFlight {
                request_id,
                issued_at_ms,
            } if now_ms >= issued_at_ms.saturating_add(self.policy.request_timeout_ms) => {
                self.record_failure(now_ms);
                Some(request_id)
            }
            _ => None,
        }
    }

    /// Issues a ticket when a request is due.
    pub fn poll(&mut self, now_ms: u64) -> Option<ReplanTicket> {
        let retry_at_ms = match self.state {
            ReplanState::Waiting { retry_at_ms } => retry_at_ms,
            _ => return None,
        };
        if now_ms < retry_at_ms {
            return None;
        }
        if self.budget_spent() {
            self.state = ReplanState::Exhausted;
            return None;
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.attempts += 1;
        self.last_issue_ms = Some(now_ms);
        self.state = ReplanState::InFlight {
            request_id,
            issued_at_ms: now_ms,
        };
        info!("Re-plan request {} issued (attempt {})", request_id, self.attempts);

        Some(ReplanTicket {
            request_id,
            attempt: self.attempts,
        })
    }

    /// True when `request_id` is the outstanding request.
    pub fn is_current(&self, request_id: u64) -> bool {
        self.in_flight() == Some(request_id)
    }

    /// The outstanding request produced a usable plan.
    pub fn succeeded(&mut self) {
        self.failures = 0;
        self.state = ReplanState::Idle;
    }

    /// The outstanding request failed (planner error or unusable answer).
    pub fn failed(&mut self, now_ms: u64) {
        if self.in_flight().is_some() {
            self.record_failure(now_ms);
        }
    }

    fn record_failure(&mut self, now_ms: u64) {
        self.failures += 1;
        if self.budget_spent() {
            self.state = ReplanState::Exhausted;
            info!("Re-plan budget exhausted after {} attempts", self.attempts);
            return;
        }
        let by_backoff = now_ms.saturating_add(self.policy.backoff_ms(self.failures));
        let by_cooldown = self
            .last_issue_ms
            .map_or(0, |t| t.saturating_add(self.policy.cooldown_ms));
        self.state = ReplanState::Waiting {
            retry_at_ms: by_backoff.max(by_cooldown),
        };
    }

    fn budget_spent(&self) -> bool {
        self.policy
            .max_attempts_per_episode
            .map_or(false, |max| self.attempts >= max)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use shapenav_env::GeoPoint;

    fn sample(offset: f64, quality: MatchQuality) -> MatchedPoint {
        MatchedPoint {
            point: GeoPoint::new(0.0, 0.0),
            segment_index: 0,
            cumulative_m: 0.0,
            lateral_offset_m: offset,
            quality,
            heading_delta_deg: None,
        }
    }

    #[test]
    fn test_deviation_signalled_once_per_episode() {
        let mut monitor = DeviationMonitor::new(DeviationConfig::default());
        let signals: Vec<DeviationSignal> = (0..8)
            .map(|_| monitor.observe(&sample(200.0, MatchQuality::Poor)))
            .collect();
        let started = signals
            .iter()
            .filter(|s| matches!(s, DeviationSignal::Deviated { .. }))
            .count();
        assert_eq!(started, 1);
        assert!(matches!(signals[3], DeviationSignal::Deviated { .. }));

        let recovered: Vec<DeviationSignal> = (0..8)
            .map(|_| monitor.observe(&sample(5.0, MatchQuality::Good)))
            .collect();
        let ended = recovered
            .iter()
            .filter(|s| **s == DeviationSignal::Recovered)
            .count();
        assert_eq!(ended, 1);
        assert!(!monitor.is_deviated());
    }

    #[test]
    fn test_poor_but_close_is_not_deviation() {
        let mut monitor = DeviationMonitor::new(DeviationConfig::default());
        for _ in 0..8 {
            assert_eq!(monitor.observe(&sample(30.0, MatchQuality::Poor)), DeviationSignal::None);
        }
    }

    #[test]
    fn test_min_samples_gate() {
        let mut monitor = DeviationMonitor::new(DeviationConfig::default());
        for _ in 0..3 {
            assert_eq!(monitor.observe(&sample(500.0, MatchQuality::Bad)), DeviationSignal::None);
        }
        assert!(matches!(
            monitor.observe(&sample(500.0, MatchQuality::Bad)),
            DeviationSignal::Deviated { .. }
        ));
    }

    #[test]
    fn test_fraction_boundary_is_exclusive() {
        let mut monitor = DeviationMonitor::new(DeviationConfig {
            window_size: 4,
            min_samples: 4,
            ..DeviationConfig::default()
        });
        monitor.observe(&sample(200.0, MatchQuality::Good));
        monitor.observe(&sample(200.0, MatchQuality::Good));
        monitor.observe(&sample(200.0, MatchQuality::Poor));
        // Exactly half poor: not a majority.
        assert_eq!(monitor.observe(&sample(200.0, MatchQuality::Poor)), DeviationSignal::None);
        assert!(matches!(
            monitor.observe(&sample(200.0, MatchQuality::Poor)),
            DeviationSignal::Deviated { .. }
        ));
    }

    #[test]
    fn test_monitor_reset_clears_window() {
        let mut monitor = DeviationMonitor::new(DeviationConfig::default());
        for _ in 0..5 {
            monitor.observe(&sample(200.0, MatchQuality::Poor));
        }
        assert!(monitor.is_deviated());
        monitor.reset();
        assert!(!monitor.is_deviated());
        assert_eq!(monitor.window_len(), 0);
        assert_eq!(monitor.mean_offset_m(), 0.0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReplanPolicy::default();
        assert_eq!(policy.backoff_ms(1), 2_000);
        assert_eq!(policy.backoff_ms(2), 4_000);
        assert_eq!(policy.backoff_ms(5), 32_000);
        assert_eq!(policy.backoff_ms(6), 60_000);
        assert_eq!(policy.backoff_ms(100), 60_000);
    }

    #[test]
    fn test_one_request_per_episode() {
        let mut s = ReplanScheduler::new(ReplanPolicy::default());
        assert!(s.poll(0).is_none());

        s.begin_episode(1_000);
        let ticket = s.poll(1_000).unwrap();
        assert_eq!(ticket.attempt, 1);
        assert!(s.poll(2_000).is_none());
        assert!(s.poll(60_000).is_none());
        assert!(s.is_current(ticket.request_id));

        s.succeeded();
        assert_eq!(s.state(), ReplanState::Idle);
        assert!(s.poll(100_000).is_none());
    }

    #[test]
    fn test_retry_respects_cooldown_and_backoff() {
        let mut s = ReplanScheduler::new(ReplanPolicy::default());
        s.begin_episode(0);
        let first = s.poll(0).unwrap();
        s.failed(1_000);
        // Backoff alone would allow 3s; cooldown holds until 30s.
        assert_eq!(s.state(), ReplanState::Waiting { retry_at_ms: 30_000 });
        assert!(s.poll(29_999).is_none());

        let second = s.poll(30_000).unwrap();
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(second.attempt, 2);
        assert!(!s.is_current(first.request_id));
    }

    #[test]
    fn test_timeout_moves_to_backoff() {
        let mut s = ReplanScheduler::new(ReplanPolicy {
            cooldown_ms: 0,
            ..ReplanPolicy::default()
        });
        s.begin_episode(0);
        let ticket = s.poll(0).unwrap();
        assert_eq!(s.expire(9_999), None);
        assert_eq!(s.expire(10_000), Some(ticket.request_id));
        assert_eq!(s.state(), ReplanState::Waiting { retry_at_ms: 12_000 });
    }

    #[test]
    fn test_episode_threshold_delays_first_request() {
        let mut s = ReplanScheduler::new(ReplanPolicy {
            episodes_before_replan: 2,
            ..ReplanPolicy::default()
        });
        s.begin_episode(0);
        assert!(s.poll(0).is_none());
        assert!(s.poll(30_000).is_some());
        s.end_episode();

        s.begin_episode(100_000);
        assert!(s.poll(100_000).is_some());
        assert_eq!(s.episodes(), 2);
    }

    #[test]
    fn test_episode_threshold_counts_from_one() {
        let mut s = ReplanScheduler::new(ReplanPolicy {
            episodes_before_replan: 1,
            ..ReplanPolicy::default()
        });
        s.begin_episode(0);
        assert_eq!(s.episodes(), 1);
        assert!(s.poll(0).is_some());

        let mut s = ReplanScheduler::new(ReplanPolicy {
            episodes_before_replan: 3,
            ..ReplanPolicy::default()
        });
        for episode in 1..=3u64 {
            let start = episode * 100_000;
            s.begin_episode(start);
            assert_eq!(s.poll(start).is_some(), episode == 3, "episode {}", episode);
            s.end_episode();
        }
    }

    #[test]
    fn test_episode_threshold_zero_requests_immediately() {
        let mut s = ReplanScheduler::new(ReplanPolicy {
            episodes_before_replan: 0,
            ..ReplanPolicy::default()
        });
        s.begin_episode(5);
        assert!(s.poll(5).is_some());
    }

    #[test]
    fn test_attempt_budget_exhausts() {
        let mut s = ReplanScheduler::new(ReplanPolicy {
            cooldown_ms: 0,
            max_attempts_per_episode: Some(2),
            ..ReplanPolicy::default()
        });
        s.begin_episode(0);
        s.poll(0).unwrap();
        s.failed(0);
        s.poll(2_000).unwrap();
        s.failed(2_000);
        assert_eq!(s.state(), ReplanState::Exhausted);
        assert!(s.poll(1_000_000).is_none());

        s.end_episode();
        s.begin_episode(2_000_000);
        assert!(s.poll(2_000_000).is_some());
    }

    #[test]
    fn test_recovery_discards_outstanding_request() {
        let mut s = ReplanScheduler::new(ReplanPolicy::default());
        s.begin_episode(0);
        let ticket = s.poll(0).unwrap();
        s.end_episode();
        assert!(!s.is_current(ticket.request_id));
        s.failed(1_000);
        assert_eq!(s.state(), ReplanState::Idle);
    }
}
