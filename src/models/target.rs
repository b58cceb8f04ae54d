//! Work targets and the keys the concurrency guard serializes on.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Project / epic / story scope a session works against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Owning project.
    pub project_id: String,
    /// Epic scope, if any.
    #[serde(default)]
    pub epic_id: Option<String>,
    /// User story scope, if any.
    #[serde(default)]
    pub user_story_id: Option<String>,
}

impl Target {
    /// Project-wide target.
    #[must_use]
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            epic_id: None,
            user_story_id: None,
        }
    }

    /// Epic-scoped target.
    #[must_use]
    pub fn epic(project_id: impl Into<String>, epic_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            epic_id: Some(epic_id.into()),
            user_story_id: None,
        }
    }

    /// Story-scoped target, optionally inside an epic.
    #[must_use]
    pub fn story(
        project_id: impl Into<String>,
        epic_id: Option<String>,
        user_story_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            epic_id,
            user_story_id: Some(user_story_id.into()),
        }
    }

    /// Key reduced to the narrowest non-null scope.
    ///
    /// `p` for a project, `p:e` for an epic, `p:e:s` for a story
    /// (`p::s` when the story has no epic).
    #[must_use]
    pub fn key(&self) -> TargetKey {
        let raw = match (&self.epic_id, &self.user_story_id) {
            (_, Some(story)) => format!(
                "{}:{}:{story}",
                self.project_id,
                self.epic_id.as_deref().unwrap_or_default()
            ),
            (Some(epic), None) => format!("{}:{epic}", self.project_id),
            (None, None) => self.project_id.clone(),
        };
        TargetKey(raw)
    }

    /// Whether this scope equals or contains `other`.
    ///
    /// A project covers all of its epics and stories; an epic covers its
    /// stories; a story covers only itself.
    #[must_use]
    pub fn covers(&self, other: &Target) -> bool {
        if self.project_id != other.project_id {
            return false;
        }
        match (&self.epic_id, &self.user_story_id) {
            (None, None) => true,
            (Some(epic), None) => other.epic_id.as_ref() == Some(epic),
            (_, Some(story)) => {
                other.user_story_id.as_ref() == Some(story) && self.epic_id == other.epic_id
            }
        }
    }
}

/// Exclusivity unit derived from a [`Target`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    /// Borrow the raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl From<String> for TargetKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl Display for TargetKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
