//! Simulation context implementing NavContext for deterministic testing.

use async_trait::async_trait;
use shapenav_env::NavContext;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::trace;

/// Simulation context backed by a manually advanced clock.
///
/// This implements `NavContext` using:
/// - A virtual clock that only moves when the driver advances it
/// - Sleep that parks the caller until the clock reaches its deadline
/// - Plain `tokio::spawn` for tasks (run them on a current-thread runtime)
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start).
    /// A watch channel so sleepers wake when the driver moves the clock.
    clock: Arc<watch::Sender<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        let (clock, _) = watch::channel(0u64);
        Self {
            seed,
            clock: Arc::new(clock),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration, waking due sleepers.
    pub fn advance_time(&self, duration: Duration) {
        let step = nanos(duration);
        self.clock.send_modify(|t| *t = t.saturating_add(step));
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        self.clock.send_replace(time_ns);
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.clock.borrow()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            clock: Arc::clone(&self.clock),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl NavContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.time_ns().saturating_add(nanos(duration));
        let mut rx = self.clock.subscribe();
        loop {
            let now = *rx.borrow_and_update();
            if now >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        trace!("spawn {} at t={}ns", name, self.time_ns());
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
