//! Session store contract and its `SQLite` implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::session::{AgentType, Session, SessionStatus};
use crate::models::target::Target;
use crate::{AppError, Result};

use super::db::Database;

/// Boxed future returned by [`SessionStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Status change applied with compare-and-set semantics.
///
/// Timestamps are write-once: a value already stored is never replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Status the row must currently have for the update to apply.
    pub expected: SessionStatus,
    /// New status.
    pub status: SessionStatus,
    /// External CLI conversation id.
    pub cli_session_id: Option<String>,
    /// Process start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason.
    pub error: Option<String>,
    /// Captured output.
    pub result_text: Option<String>,
}

impl StatusUpdate {
    /// Bare transition with no field changes.
    #[must_use]
    pub fn transition(expected: SessionStatus, status: SessionStatus) -> Self {
        Self {
            expected,
            status,
            cli_session_id: None,
            started_at: None,
            completed_at: None,
            error: None,
            result_text: None,
        }
    }
}

/// Durable record of sessions.
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn SessionStore>`.
pub trait SessionStore: Send + Sync {
    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the id already exists.
    fn create<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, Session>;

    /// Fetch a session by id.
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>>;

    /// Apply `update` if the row is still in `update.expected`.
    ///
    /// Returns `None` when the row is missing or its status differs.
    fn update_status<'a>(
        &'a self,
        id: &'a str,
        update: &'a StatusUpdate,
    ) -> StoreFuture<'a, Option<Session>>;

    /// All sessions in `status`, oldest first.
    fn list_by_status(&self, status: SessionStatus) -> StoreFuture<'_, Vec<Session>>;

    /// Queued or running sessions on exactly `target`.
    fn list_active_for_target<'a>(&'a self, target: &'a Target) -> StoreFuture<'a, Vec<Session>>;

    /// All sessions for a project, newest first.
    fn list_for_project<'a>(&'a self, project_id: &'a str) -> StoreFuture<'a, Vec<Session>>;
}

/// `SQLite`-backed session store.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    project_id: String,
    epic_id: Option<String>,
    user_story_id: Option<String>,
    agent_type: String,
    provider: String,
    status: String,
    cli_session_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    result_text: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            id: self.id,
            project_id: self.project_id,
            epic_id: self.epic_id,
            user_story_id: self.user_story_id,
            agent_type: AgentType::parse(&self.agent_type)?,
            provider: self.provider,
            status: SessionStatus::parse(&self.status)?,
            cli_session_id: self.cli_session_id,
            created_at: parse_ts(&self.created_at, "created_at")?,
            started_at: self
                .started_at
                .as_deref()
                .map(|raw| parse_ts(raw, "started_at"))
                .transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|raw| parse_ts(raw, "completed_at"))
                .transpose()?,
            error: self.error,
            result_text: self.result_text,
        })
    }
}

fn parse_ts(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn into_sessions(rows: Vec<SessionRow>) -> Result<Vec<Session>> {
    rows.into_iter().map(SessionRow::into_session).collect()
}

impl SessionStore for SessionRepo {
    fn create<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, Session> {
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO agent_session (id, project_id, epic_id, user_story_id,
                 agent_type, provider, status, cli_session_id, created_at, started_at,
                 completed_at, error, result_text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(&session.id)
            .bind(&session.project_id)
            .bind(&session.epic_id)
            .bind(&session.user_story_id)
            .bind(session.agent_type.as_str())
            .bind(&session.provider)
            .bind(session.status.as_str())
            .bind(&session.cli_session_id)
            .bind(format_ts(&session.created_at))
            .bind(session.started_at.as_ref().map(format_ts))
            .bind(session.completed_at.as_ref().map(format_ts))
            .bind(&session.error)
            .bind(&session.result_text)
            .execute(self.db.as_ref())
            .await;

            match result {
                Ok(_) => Ok(session.clone()),
                Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Err(
                    AppError::Conflict(format!("session {} already exists", session.id)),
                ),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let row: Option<SessionRow> =
                sqlx::query_as("SELECT * FROM agent_session WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(self.db.as_ref())
                    .await?;
            row.map(SessionRow::into_session).transpose()
        })
    }

    fn update_status<'a>(
        &'a self,
        id: &'a str,
        update: &'a StatusUpdate,
    ) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let applied = sqlx::query(
                "UPDATE agent_session SET
                    status = ?1,
                    cli_session_id = COALESCE(?2, cli_session_id),
                    started_at = COALESCE(started_at, ?3),
                    completed_at = COALESCE(completed_at, ?4),
                    error = COALESCE(?5, error),
                    result_text = COALESCE(?6, result_text)
                 WHERE id = ?7 AND status = ?8",
            )
            .bind(update.status.as_str())
            .bind(&update.cli_session_id)
            .bind(update.started_at.as_ref().map(format_ts))
            .bind(update.completed_at.as_ref().map(format_ts))
            .bind(&update.error)
            .bind(&update.result_text)
            .bind(id)
            .bind(update.expected.as_str())
            .execute(self.db.as_ref())
            .await?
            .rows_affected();

            if applied == 0 {
                return Ok(None);
            }
            self.get(id).await
        })
    }

    fn list_by_status(&self, status: SessionStatus) -> StoreFuture<'_, Vec<Session>> {
        Box::pin(async move {
            let rows: Vec<SessionRow> = sqlx::query_as(
                "SELECT * FROM agent_session WHERE status = ?1 ORDER BY created_at ASC",
            )
            .bind(status.as_str())
            .fetch_all(self.db.as_ref())
            .await?;
            into_sessions(rows)
        })
    }

    fn list_active_for_target<'a>(&'a self, target: &'a Target) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(async move {
            let rows: Vec<SessionRow> = sqlx::query_as(
                "SELECT * FROM agent_session
                 WHERE project_id = ?1 AND epic_id IS ?2 AND user_story_id IS ?3
                   AND status IN ('queued', 'running')
                 ORDER BY created_at ASC",
            )
            .bind(&target.project_id)
            .bind(&target.epic_id)
            .bind(&target.user_story_id)
            .fetch_all(self.db.as_ref())
            .await?;
            into_sessions(rows)
        })
    }

    fn list_for_project<'a>(&'a self, project_id: &'a str) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(async move {
            let rows: Vec<SessionRow> = sqlx::query_as(
                "SELECT * FROM agent_session WHERE project_id = ?1 ORDER BY created_at DESC",
            )
            .bind(project_id)
            .fetch_all(self.db.as_ref())
            .await?;
            into_sessions(rows)
        })
    }
}
