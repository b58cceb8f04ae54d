//! Startup reconciliation.
//!
//! A fresh supervisor owns no processes, so any session the store still
//! reports as live belongs to a previous orchestrator instance. Those rows
//! are resolved before new work is accepted so their target keys cannot
//! stay blocked.

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use super::session_manager::LifecycleManager;
use super::supervisor::ProcessSupervisor;
use crate::models::session::{SessionStatus, TerminalOutcome};
use crate::{AppError, Result};

/// Error recorded on sessions that were running when the orchestrator died.
pub const RESTARTED_WHILE_RUNNING: &str = "orchestrator restarted while running";

/// Error recorded on sessions that never reached their process.
pub const RESTARTED_BEFORE_LAUNCH: &str = "orchestrator restarted before launch";

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Running sessions moved to `failed`.
    pub failed: Vec<String>,
    /// Queued sessions moved to `cancelled`.
    pub cancelled: Vec<String>,
    /// Rows that were inconsistent and forced to `failed`.
    pub inconsistent: Vec<String>,
}

impl ReconcileReport {
    /// Number of sessions touched.
    #[must_use]
    pub fn total(&self) -> usize {
        self.failed.len() + self.cancelled.len()
    }
}

/// Resolve sessions left live by a previous process.
///
/// # Errors
///
/// Returns `AppError::Db` if the store cannot be listed. Failures on
/// individual rows are logged and the pass continues.
pub async fn reconcile(
    lifecycle: &LifecycleManager,
    supervisor: &ProcessSupervisor,
) -> Result<ReconcileReport> {
    async move {
        let mut report = ReconcileReport::default();
        let store = lifecycle.store();

        for session in store.list_by_status(SessionStatus::Running).await? {
            if supervisor.is_tracked(&session.id) {
                continue;
            }

            if let Some(completed_at) = session.completed_at {
                let err = AppError::Reconciliation(format!(
                    "session {} is running but completed at {completed_at}",
                    session.id
                ));
                error!(session_id = session.id, %err, "inconsistent session row, forcing failed");
                report.inconsistent.push(session.id.clone());
            }

            match lifecycle
                .mark_terminal(
                    &session.id,
                    TerminalOutcome::failure(RESTARTED_WHILE_RUNNING),
                    Utc::now(),
                )
                .await
            {
                Ok(_) => report.failed.push(session.id),
                Err(err) => {
                    error!(session_id = session.id, %err, "failed to reconcile running session");
                }
            }
        }

        for session in store.list_by_status(SessionStatus::Queued).await? {
            if supervisor.is_tracked(&session.id) {
                continue;
            }
            match lifecycle
                .mark_terminal(
                    &session.id,
                    TerminalOutcome::cancelled(RESTARTED_BEFORE_LAUNCH),
                    Utc::now(),
                )
                .await
            {
                Ok(_) => report.cancelled.push(session.id),
                Err(err) => {
                    warn!(session_id = session.id, %err, "failed to reconcile queued session");
                }
            }
        }

        if report.total() == 0 {
            info!("no sessions left live by a previous run");
        } else {
            info!(
                failed = report.failed.len(),
                cancelled = report.cancelled.len(),
                inconsistent = report.inconsistent.len(),
                "reconciled sessions from a previous run"
            );
        }
        Ok(report)
    }
    .instrument(info_span!("reconcile"))
    .await
}
