//! Ephemeral state-change events routed by project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::Session;

/// Event kinds emitted on the bus and delivered to observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Synthetic acknowledgement sent once per push connection.
    #[serde(rename = "connected")]
    Connected,
    /// A ticket changed column.
    #[serde(rename = "ticket:moved")]
    TicketMoved,
    /// A session row was created.
    #[serde(rename = "session:queued")]
    SessionQueued,
    /// A session's process started.
    #[serde(rename = "session:started")]
    SessionStarted,
    /// A session finished successfully.
    #[serde(rename = "session:completed")]
    SessionCompleted,
    /// A session failed or was cancelled.
    #[serde(rename = "session:failed")]
    SessionFailed,
}

impl EventType {
    /// Wire name, also used as the SSE `event:` field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::TicketMoved => "ticket:moved",
            Self::SessionQueued => "session:queued",
            Self::SessionStarted => "session:started",
            Self::SessionCompleted => "session:completed",
            Self::SessionFailed => "session:failed",
        }
    }
}

/// A single state-change notification. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Routing key.
    pub project_id: String,
    /// Epic the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    /// Free-form payload.
    #[serde(default)]
    pub data: Value,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: EventType, project_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            project_id: project_id.into(),
            epic_id: None,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Attach an epic id.
    #[must_use]
    pub fn with_epic(mut self, epic_id: Option<String>) -> Self {
        self.epic_id = epic_id;
        self
    }

    /// Lifecycle event describing `session`.
    #[must_use]
    pub fn for_session(event_type: EventType, session: &Session) -> Self {
        let data = serde_json::json!({
            "sessionId": session.id,
            "status": session.status,
            "agentType": session.agent_type,
            "provider": session.provider,
            "userStoryId": session.user_story_id,
            "error": session.error,
        });
        Self::new(event_type, session.project_id.clone(), data).with_epic(session.epic_id.clone())
    }

    /// Connection acknowledgement for `project_id`.
    #[must_use]
    pub fn connected(project_id: impl Into<String>) -> Self {
        Self::new(EventType::Connected, project_id, Value::Null)
    }
}
