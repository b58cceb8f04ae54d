//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::Target;
use crate::{AppError, Result};

/// Lifecycle status for an agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Row created, process not yet started.
    Queued,
    /// External CLI process is running.
    Running,
    /// Process exited successfully.
    Completed,
    /// Process failed, could not be spawned, or was orphaned by a restart.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl SessionStatus {
    /// Stable string form used in storage and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stored string form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown status string.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::Db(format!("invalid session status: {other}"))),
        }
    }

    /// Whether no further transitions are possible from this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a session in this status holds its target key.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `queued -> failed` exists only for launches whose process never
    /// started.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running | Self::Cancelled | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work an agent performs. Labels sessions; never affects state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Implements a ticket.
    Build,
    /// Reviews produced changes.
    Review,
    /// Technical feasibility check.
    TechCheck,
    /// End-to-end test run.
    E2eTest,
    /// Interactive chat about a ticket.
    Chat,
    /// Merges a finished branch.
    Merge,
    /// Fixes problems reported by a previous agent.
    Fix,
}

impl AgentType {
    /// Stable string form used in storage and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Review => "review",
            Self::TechCheck => "tech_check",
            Self::E2eTest => "e2e_test",
            Self::Chat => "chat",
            Self::Merge => "merge",
            Self::Fix => "fix",
        }
    }

    /// Parse the stored string form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown agent type.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "build" => Ok(Self::Build),
            "review" => Ok(Self::Review),
            "tech_check" => Ok(Self::TechCheck),
            "e2e_test" => Ok(Self::E2eTest),
            "chat" => Ok(Self::Chat),
            "merge" => Ok(Self::Merge),
            "fix" => Ok(Self::Fix),
            other => Err(AppError::Db(format!("invalid agent type: {other}"))),
        }
    }
}

/// Session domain entity persisted by the session store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Caller-generated identifier; immutable.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Epic scope, if any.
    pub epic_id: Option<String>,
    /// User story scope, if any.
    pub user_story_id: Option<String>,
    /// Kind of work.
    pub agent_type: AgentType,
    /// Backend CLI that executes the work.
    pub provider: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Conversation id assigned to the external CLI, used for resume.
    pub cli_session_id: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Process start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Raw output captured at completion.
    pub result_text: Option<String>,
}

impl Session {
    /// Construct a queued session for `target`.
    #[must_use]
    pub fn queued(id: String, target: &Target, agent_type: AgentType, provider: String) -> Self {
        Self {
            id,
            project_id: target.project_id.clone(),
            epic_id: target.epic_id.clone(),
            user_story_id: target.user_story_id.clone(),
            agent_type,
            provider,
            status: SessionStatus::Queued,
            cli_session_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result_text: None,
        }
    }

    /// Construct a queued session with a generated identifier.
    #[must_use]
    pub fn new(target: &Target, agent_type: AgentType, provider: String) -> Self {
        Self::queued(Uuid::new_v4().to_string(), target, agent_type, provider)
    }

    /// Scope this session claims.
    #[must_use]
    pub fn target(&self) -> Target {
        Target {
            project_id: self.project_id.clone(),
            epic_id: self.epic_id.clone(),
            user_story_id: self.user_story_id.clone(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Work finished successfully.
    Success,
    /// Work failed.
    Failure,
    /// Work was cancelled.
    Cancelled,
}

/// Terminal outcome handed to the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOutcome {
    /// Outcome kind.
    pub kind: OutcomeKind,
    /// Failure reason; ignored on success.
    pub error: Option<String>,
    /// Captured output.
    pub result_text: Option<String>,
}

impl TerminalOutcome {
    /// Successful completion with optional captured output.
    #[must_use]
    pub fn success(result_text: Option<String>) -> Self {
        Self {
            kind: OutcomeKind::Success,
            error: None,
            result_text,
        }
    }

    /// Failure with a reason.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            error: Some(error.into()),
            result_text: None,
        }
    }

    /// Cancellation with a reason.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Cancelled,
            error: Some(reason.into()),
            result_text: None,
        }
    }

    /// Attach captured output.
    #[must_use]
    pub fn with_result_text(mut self, result_text: Option<String>) -> Self {
        self.result_text = result_text;
        self
    }

    /// Status this outcome moves a session into.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self.kind {
            OutcomeKind::Success => SessionStatus::Completed,
            OutcomeKind::Failure => SessionStatus::Failed,
            OutcomeKind::Cancelled => SessionStatus::Cancelled,
        }
    }
}
