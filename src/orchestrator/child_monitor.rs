//! Per-session process watcher.
//!
//! Polls the supervisor until the session's process exits, then drives the
//! terminal transition and stops tracking the process. The lifecycle manager
//! is idempotent, so a watcher that loses the race against a cancel
//! produces no second transition or event.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::session_manager::LifecycleManager;
use super::supervisor::{ProcessResult, ProcessSnapshot, ProcessStatus, ProcessSupervisor};
use crate::models::session::TerminalOutcome;
use crate::AppError;

/// Spawn a watcher for `session_id` on `tracker`.
///
/// The task polls every `poll_interval` until the process exits or the
/// `CancellationToken` fires.
pub fn spawn_session_watcher(
    session_id: String,
    lifecycle: Arc<LifecycleManager>,
    supervisor: Arc<ProcessSupervisor>,
    poll_interval: Duration,
    cancel: CancellationToken,
    tracker: &TaskTracker,
) -> tokio::task::JoinHandle<()> {
    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(session_id, "session watcher shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if poll_session(&session_id, &lifecycle, &supervisor).await {
                break;
            }
        }
    })
}

/// Check one session. Returns `true` once the watcher is done.
async fn poll_session(
    session_id: &str,
    lifecycle: &LifecycleManager,
    supervisor: &ProcessSupervisor,
) -> bool {
    let snapshot = match supervisor.get_status(session_id) {
        Ok(snapshot) => snapshot,
        Err(AppError::NotFound(_)) => {
            debug!(session_id, "process no longer tracked");
            return true;
        }
        Err(err) => {
            warn!(session_id, %err, "failed to poll agent process");
            return false;
        }
    };

    let Some(outcome) = outcome_for(&snapshot) else {
        return false;
    };

    match snapshot.result.as_ref().and_then(ProcessResult::exit_error) {
        Some(err) => info!(session_id, %err, outcome = ?outcome.kind, "agent process exited"),
        None => info!(session_id, outcome = ?outcome.kind, "agent process exited"),
    }

    match lifecycle
        .mark_terminal(session_id, outcome, Utc::now())
        .await
    {
        Ok(_) => {
            supervisor.remove(session_id);
            true
        }
        Err(err @ AppError::InvalidTransition { .. }) => {
            warn!(session_id, %err, "cannot record process exit");
            supervisor.remove(session_id);
            true
        }
        Err(err) => {
            // Retried on the next tick.
            warn!(session_id, %err, "failed to record process exit");
            false
        }
    }
}

/// Map an exited process to the terminal outcome it implies.
///
/// Returns `None` while the process is still running.
#[must_use]
pub fn outcome_for(snapshot: &ProcessSnapshot) -> Option<TerminalOutcome> {
    if snapshot.status == ProcessStatus::Running {
        return None;
    }
    let result = snapshot.result.as_ref();
    let output = result
        .map(|r| r.output.trim())
        .filter(|text| !text.is_empty())
        .map(str::to_owned);

    let outcome = match (snapshot.status, result) {
        (ProcessStatus::Cancelled, _) => TerminalOutcome::cancelled("cancelled"),
        (_, Some(r)) if r.success => TerminalOutcome::success(output),
        (_, Some(r)) => TerminalOutcome::failure(
            r.error
                .clone()
                .unwrap_or_else(|| "agent process failed".to_owned()),
        )
        .with_result_text(output),
        (_, None) => TerminalOutcome::failure("agent process exited without a result"),
    };
    Some(outcome)
}
