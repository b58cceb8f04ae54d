//! Session lifecycle state machine.
//!
//! `queued -> running -> {completed, failed, cancelled}`, plus
//! `queued -> cancelled` and `queued -> failed` for sessions whose process
//! never started. The manager is the only writer of session status. On
//! every terminal transition it persists, releases the target key, and
//! then emits the terminal event, in that order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use super::guard::ConcurrencyGuard;
use super::supervisor::{CancelOutcome, ProcessSupervisor};
use crate::events::EventBus;
use crate::models::event::{Event, EventType};
use crate::models::session::{Session, SessionStatus, TerminalOutcome};
use crate::persistence::{SessionStore, StatusUpdate};
use crate::{AppError, Result};

/// Attempts before giving up on a terminal transition that keeps racing.
const TERMINAL_RETRIES: usize = 3;

/// Validates and applies lifecycle transitions.
pub struct LifecycleManager {
    store: Arc<dyn SessionStore>,
    guard: Arc<ConcurrencyGuard>,
    bus: EventBus,
    supervisor: Arc<ProcessSupervisor>,
}

impl LifecycleManager {
    /// Create a manager over injected collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        guard: Arc<ConcurrencyGuard>,
        bus: EventBus,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            store,
            guard,
            bus,
            supervisor,
        }
    }

    /// Session store the manager writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Load a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get(&self, id: &str) -> Result<Session> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// Insert `session` in the `queued` state.
    ///
    /// The caller must already hold the target key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the id already exists.
    pub async fn create_queued(&self, mut session: Session) -> Result<Session> {
        let span = info_span!("create_queued", session_id = session.id);
        async move {
            session.status = SessionStatus::Queued;
            session.started_at = None;
            session.completed_at = None;
            session.error = None;
            session.result_text = None;

            let created = self.store.create(&session).await?;
            info!(target_key = %created.target().key(), "session queued");
            self.bus
                .emit(&Event::for_session(EventType::SessionQueued, &created));
            Ok(created)
        }
        .instrument(span)
        .await
    }

    /// Move a queued session to `running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` unless the session is `queued`,
    /// and `AppError::NotFound` if it does not exist.
    pub async fn mark_running(
        &self,
        id: &str,
        cli_session_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Result<Session> {
        let span = info_span!("mark_running", session_id = id);
        async move {
            let current = self.get(id).await?;
            if current.status != SessionStatus::Queued {
                return Err(invalid(id, current.status, SessionStatus::Running));
            }

            let update = StatusUpdate {
                cli_session_id,
                started_at: Some(started_at),
                ..StatusUpdate::transition(SessionStatus::Queued, SessionStatus::Running)
            };
            let Some(running) = self.store.update_status(id, &update).await? else {
                let now = self.get(id).await?;
                return Err(invalid(id, now.status, SessionStatus::Running));
            };

            info!("session running");
            self.bus
                .emit(&Event::for_session(EventType::SessionStarted, &running));
            Ok(running)
        }
        .instrument(span)
        .await
    }

    /// Move a session into the terminal state described by `outcome`.
    ///
    /// Calling this on a session that is already terminal is a no-op that
    /// returns the stored state; no second event is emitted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` for an illegal edge (for example
    /// `queued -> completed`) and `AppError::NotFound` for an unknown id.
    pub async fn mark_terminal(
        &self,
        id: &str,
        outcome: TerminalOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<Session> {
        let span = info_span!("mark_terminal", session_id = id, outcome = ?outcome.kind);
        async move {
            let target = outcome.status();
            for _ in 0..TERMINAL_RETRIES {
                let current = self.get(id).await?;
                if current.status.is_terminal() {
                    debug!(status = %current.status, "session already terminal");
                    return Ok(current);
                }
                if !current.status.can_transition_to(target) {
                    return Err(invalid(id, current.status, target));
                }

                let completed_at = match current.started_at {
                    Some(started) if started > completed_at => {
                        warn!(%started, %completed_at, "completion precedes start, clamping");
                        started
                    }
                    _ => completed_at,
                };
                let update = StatusUpdate {
                    completed_at: Some(completed_at),
                    error: if target == SessionStatus::Completed {
                        None
                    } else {
                        outcome.error.clone()
                    },
                    result_text: outcome.result_text.clone(),
                    ..StatusUpdate::transition(current.status, target)
                };

                if let Some(done) = self.store.update_status(id, &update).await? {
                    self.finish(&done);
                    return Ok(done);
                }
                debug!("terminal transition raced, re-reading");
            }
            Err(AppError::Db(format!(
                "session {id} kept changing during terminal transition"
            )))
        }
        .instrument(span)
        .await
    }

    /// Cancel a session on behalf of a caller.
    ///
    /// Queued sessions are cancelled directly. For running sessions the
    /// process is terminated first; a natural exit observed by the watcher
    /// afterwards is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is already
    /// terminal and `AppError::NotFound` if it does not exist.
    pub async fn cancel(&self, id: &str) -> Result<Session> {
        let span = info_span!("cancel_session", session_id = id);
        async move {
            let current = self.get(id).await?;
            match current.status {
                SessionStatus::Queued => {
                    self.mark_terminal(
                        id,
                        TerminalOutcome::cancelled("cancelled before start"),
                        Utc::now(),
                    )
                    .await
                }
                SessionStatus::Running => {
                    if self.supervisor.is_tracked(id) {
                        match self.supervisor.cancel(id).await {
                            Ok(CancelOutcome::StillRunning) => {
                                warn!("process still running after cancel; marking cancelled");
                            }
                            Ok(outcome) => debug!(?outcome, "process terminated"),
                            Err(err) => warn!(%err, "process termination failed"),
                        }
                    } else {
                        warn!("running session has no supervised process");
                    }
                    self.mark_terminal(id, TerminalOutcome::cancelled("cancelled"), Utc::now())
                        .await
                }
                status => Err(invalid(id, status, SessionStatus::Cancelled)),
            }
        }
        .instrument(span)
        .await
    }

    fn finish(&self, session: &Session) {
        let key = session.target().key();
        if !self.guard.release_held_by(&key, &session.id) {
            debug!(target_key = %key, "target was not held by this session");
        }

        let event_type = if session.status == SessionStatus::Completed {
            EventType::SessionCompleted
        } else {
            EventType::SessionFailed
        };
        info!(status = %session.status, error = ?session.error, "session finished");
        self.bus.emit(&Event::for_session(event_type, session));
    }
}

fn invalid(id: &str, current: SessionStatus, attempted: SessionStatus) -> AppError {
    AppError::InvalidTransition {
        session_id: id.to_owned(),
        current,
        attempted,
    }
}
