//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the session table and its indexes.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS agent_session (
    id              TEXT PRIMARY KEY NOT NULL,
    project_id      TEXT NOT NULL,
    epic_id         TEXT,
    user_story_id   TEXT,
    agent_type      TEXT NOT NULL,
    provider        TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('queued','running','completed','failed','cancelled')),
    cli_session_id  TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    error           TEXT,
    result_text     TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_session_status ON agent_session(status);
CREATE INDEX IF NOT EXISTS idx_agent_session_project ON agent_session(project_id, created_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
