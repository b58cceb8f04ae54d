//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::models::session::SessionStatus;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A session with the same identifier already exists.
    Conflict(String),
    /// An illegal lifecycle edge was attempted.
    InvalidTransition {
        /// Session the transition was attempted on.
        session_id: String,
        /// Status the session was in.
        current: SessionStatus,
        /// Status the caller tried to move to.
        attempted: SessionStatus,
    },
    /// The target key is held by another live session.
    AlreadyRunning {
        /// Contended target key.
        target_key: String,
        /// Session currently holding the key.
        holding_session_id: String,
    },
    /// The external CLI could not be started.
    Spawn(String),
    /// The external CLI ran but exited unsuccessfully.
    ProcessExit {
        /// Exit code, absent when the process was killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// Crash recovery found a row it could not resolve cleanly.
    Reconciliation(String),
    /// A resume id was supplied for a provider that cannot resume.
    ResumeUnsupported {
        /// Provider that rejected the resume request.
        provider: String,
    },
    /// Observer HTTP client failure.
    Http(String),
}

impl AppError {
    /// Short machine-readable tag for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Db(_) => "db",
            Self::Io(_) => "io",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyRunning { .. } => "already_running",
            Self::Spawn(_) => "spawn",
            Self::ProcessExit { .. } => "process_exit",
            Self::Reconciliation(_) => "reconciliation",
            Self::ResumeUnsupported { .. } => "resume_unsupported",
            Self::Http(_) => "http",
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::InvalidTransition {
                session_id,
                current,
                attempted,
            } => write!(
                f,
                "invalid transition for session {session_id}: {current} -> {attempted}"
            ),
            Self::AlreadyRunning {
                target_key,
                holding_session_id,
            } => write!(
                f,
                "agent already running on {target_key} (session {holding_session_id})"
            ),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::ProcessExit { exit_code, stderr } => match exit_code {
                Some(code) => write!(f, "process exited with code {code}: {stderr}"),
                None => write!(f, "process terminated by signal: {stderr}"),
            },
            Self::Reconciliation(msg) => write!(f, "reconciliation: {msg}"),
            Self::ResumeUnsupported { provider } => {
                write!(f, "provider {provider} does not support resume")
            }
            Self::Http(msg) => write!(f, "http: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
