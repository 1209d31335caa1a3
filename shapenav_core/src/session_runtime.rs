//! Async orchestration of navigation sessions.
//!
//! One task per session consumes an ordered queue of [`SessionInput`]s, so
//! fixes and planner answers are applied strictly in arrival order. Planner
//! calls run in their own tasks and report back through the same queue,
//! which keeps network I/O off the ingestion path.
//!
//! ```text
//!  ingest(fix) ──▶ [session queue] ──▶ NavSession ──▶ SessionUpdate ──▶ consumer
//!                        ▲                  │
//!                        │ PlanReady        │ ReplanCommand
//!                        └──── planner task ◀┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shapenav_env::{EnvError, ManeuverPlanner, NavContext, PlanResponse, SessionId, ShapeId};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::NavError;
use crate::route_registry::RouteRegistry;
use crate::session::{NavEvent, NavSession, NavigationState, ReplanCommand, SessionStep};
use crate::shapenav_matcher::Fix;

/// Inputs of a session task, applied in queue order.
#[derive(Debug)]
pub enum SessionInput {
    Fix(Fix),
    PlanReady {
        request_id: u64,
        result: Result<PlanResponse, EnvError>,
    },
    Shutdown,
}

/// What the state consumer receives, per session in production order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub session_id: SessionId,
    pub state: NavigationState,
    pub events: Vec<NavEvent>,

    /// Set when a fix was refused; `state` is then the unchanged state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// Sending side of one session's queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    tx: mpsc::Sender<SessionInput>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queues a fix, waiting for room when the queue is full.
    pub async fn send_fix(&self, fix: Fix) -> Result<(), NavError> {
        self.tx
            .send(SessionInput::Fix(fix))
            .await
            .map_err(|_| NavError::SessionClosed(self.session_id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

pub struct SessionRuntime<Ctx: NavContext, P: ManeuverPlanner> {
    ctx: Arc<Ctx>,
    planner: Arc<P>,
    registry: Arc<RouteRegistry>,
    config: Arc<EngineConfig>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl<Ctx: NavContext, P: ManeuverPlanner> SessionRuntime<Ctx, P> {
    pub fn new(ctx: Arc<Ctx>, planner: Arc<P>, registry: Arc<RouteRegistry>, config: EngineConfig) -> Self {
        Self {
            ctx,
            planner,
            registry,
            config: Arc::new(config),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts tracking `session_id` against the current version of `shape_id`.
    ///
    /// The session keeps that version even if the shape is reloaded later.
    pub fn start_session(
        &self,
        session_id: SessionId,
        shape_id: &ShapeId,
        updates: mpsc::Sender<SessionUpdate>,
    ) -> Result<SessionHandle, NavError> {
        let route = self
            .registry
            .get(shape_id)
            .ok_or_else(|| NavError::UnknownShape(shape_id.clone()))?;

        let (tx, rx) = mpsc::channel(self.config.runtime.queue_capacity.max(1));
        let session = NavSession::new(session_id, route.clone(), &self.config);
        let worker = SessionWorker {
            ctx: self.ctx.clone(),
            planner: self.planner.clone(),
            config: self.config.clone(),
            session,
            loopback: tx.downgrade(),
            updates,
            last_sequence: 0,
        };
        self.ctx
            .spawn(&format!("session-{}", session_id), worker.run(rx));

        let handle = SessionHandle { session_id, tx };
        let previous = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, handle.clone());
        if let Some(old) = previous {
            let _ = old.tx.try_send(SessionInput::Shutdown);
        }

        info!("Session {} started on shape {} v{}", session_id, shape_id, route.version());
        Ok(handle)
    }

    /// Queues a fix for a running session.
    pub async fn ingest(&self, session_id: SessionId, fix: Fix) -> Result<(), NavError> {
        let handle = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
            .ok_or(NavError::UnknownSession(session_id))?;
        let result = handle.send_fix(fix).await;
        if result.is_err() {
            self.prune_closed();
        }
        result
    }

    /// Stops a session after everything already queued has been processed.
    pub async fn end_session(&self, session_id: SessionId) -> Result<(), NavError> {
        let handle = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
            .ok_or(NavError::UnknownSession(session_id))?;
        handle
            .tx
            .send(SessionInput::Shutdown)
            .await
            .map_err(|_| NavError::SessionClosed(session_id))
    }

    /// Live sessions. Handles of workers that exited on their own (the
    /// consumer went away) are dropped here.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, h| !h.is_closed());
        sessions.keys().copied().collect()
    }

    fn prune_closed(&self) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, h| {
                let closed = h.is_closed();
                if closed {
                    debug!("Session {} worker gone, handle removed", id);
                }
                !closed
            });
    }
}

// ============================================================================
// SESSION TASK
// ============================================================================

struct SessionWorker<Ctx: NavContext, P: ManeuverPlanner> {
    ctx: Arc<Ctx>,
    planner: Arc<P>,
    config: Arc<EngineConfig>,
    session: NavSession,

    /// Weak so the queue closes once every external handle is gone
    loopback: mpsc::WeakSender<SessionInput>,

    updates: mpsc::Sender<SessionUpdate>,
    last_sequence: u64,
}

impl<Ctx: NavContext, P: ManeuverPlanner> SessionWorker<Ctx, P> {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionInput>) {
        let tick = Duration::from_millis(self.config.runtime.tick_interval_ms.max(1));
        let session_id = self.session.session_id();

        loop {
            let input = tokio::select! {
                input = rx.recv() => input,
                _ = self.ctx.sleep(tick) => {
                    if let Some(step) = self.session.poll(self.ctx.now()) {
                        if !self.publish(step, None).await {
                            break;
                        }
                    }
                    continue;
                }
            };

            let keep_going = match input {
                None | Some(SessionInput::Shutdown) => false,
                Some(SessionInput::Fix(fix)) => match self.session.handle_fix(&fix, self.ctx.now()) {
                    Ok(step) => self.publish(step, None).await,
                    Err(e) if e.is_silent() => true,
                    Err(e) => {
                        let step = SessionStep {
                            state: self.session.state().clone(),
                            events: Vec::new(),
                            replan: None,
                        };
                        self.publish(step, Some(e.to_string())).await
                    }
                },
                Some(SessionInput::PlanReady { request_id, result }) => {
                    match self.session.handle_plan(request_id, result, self.ctx.now()) {
                        Some(step) => self.publish(step, None).await,
                        None => true,
                    }
                }
            };

            if !keep_going {
                break;
            }
        }

        drop(rx);
        debug!("Session {} task finished", session_id);
    }

    /// Dispatches any re-plan command and forwards the update. Returns false
    /// when the consumer has gone away.
    async fn publish(&mut self, step: SessionStep, rejected: Option<String>) -> bool {
        if let Some(command) = step.replan {
            self.dispatch(command);
        }

        let unchanged = step.state.sequence == self.last_sequence;
        if unchanged && step.events.is_empty() && rejected.is_none() {
            return true;
        }
        self.last_sequence = step.state.sequence;

        let update = SessionUpdate {
            session_id: self.session.session_id(),
            state: step.state,
            events: step.events,
            rejected,
        };
        self.updates.send(update).await.is_ok()
    }

    /// Runs the planner call in its own task, bounded by the request timeout.
    fn dispatch(&self, command: ReplanCommand) {
        let ctx = self.ctx.clone();
        let planner = self.planner.clone();
        let loopback = self.loopback.clone();
        let timeout_ms = self.config.replan.request_timeout_ms;
        let request_id = command.request_id;

        self.ctx.spawn(&format!("replan-{}", request_id), async move {
            let result = tokio::select! {
                result = planner.plan(command.request) => result,
                _ = ctx.sleep(Duration::from_millis(timeout_ms)) => Err(EnvError::Timeout(timeout_ms)),
            };
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(SessionInput::PlanReady { request_id, result }).await;
            }
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
