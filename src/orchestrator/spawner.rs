//! Session launch.
//!
//! A launch claims the target key, records a queued session, starts the
//! agent CLI through the supervisor, and moves the session to `running`.
//! Every failure after the key is claimed leaves the session terminal and
//! the key released.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::guard::ConcurrencyGuard;
use super::provider::SpawnSpec;
use super::session_manager::LifecycleManager;
use super::supervisor::ProcessSupervisor;
use crate::models::session::{AgentType, Session, SessionStatus, TerminalOutcome};
use crate::models::target::{Target, TargetKey};
use crate::{AppError, Result};

/// Request to run an agent against a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    /// Explicit session id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Unit of work the agent operates on.
    #[serde(flatten)]
    pub target: Target,
    /// Kind of agent.
    pub agent_type: AgentType,
    /// Provider name.
    pub provider: String,
    /// Prompt handed to the CLI.
    pub prompt: String,
    /// Directory the CLI runs in.
    pub working_directory: PathBuf,
    /// Prior conversation to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    /// Model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    /// Tools the agent may use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Extra CLI arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl LaunchRequest {
    /// Request with only the required fields set.
    #[must_use]
    pub fn new(
        target: Target,
        agent_type: AgentType,
        provider: impl Into<String>,
        prompt: impl Into<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_id: None,
            target,
            agent_type,
            provider: provider.into(),
            prompt: prompt.into(),
            working_directory: working_directory.into(),
            resume_id: None,
            model_override: None,
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    fn spawn_spec(&self, cli_session_id: Option<String>) -> SpawnSpec {
        SpawnSpec {
            provider: self.provider.clone(),
            prompt: self.prompt.clone(),
            working_directory: self.working_directory.clone(),
            cli_session_id,
            resume_id: self.resume_id.clone(),
            model_override: self.model_override.clone(),
            allowed_tools: self.allowed_tools.clone(),
            extra_args: self.extra_args.clone(),
            env: Vec::new(),
        }
    }
}

/// Launch a session and return it in the `running` state.
///
/// # Errors
///
/// - `AppError::AlreadyRunning` if another live session holds the target.
/// - `AppError::Conflict` if the requested session id already exists.
/// - `AppError::ResumeUnsupported` or `AppError::Spawn` if the provider
///   rejects the request or the process cannot start.
/// - `AppError::InvalidTransition` if the session was cancelled before its
///   process started.
///
/// Once the session row exists, every failure leaves it terminal and the
/// target released.
pub async fn launch_session(
    request: LaunchRequest,
    guard: &ConcurrencyGuard,
    lifecycle: &LifecycleManager,
    supervisor: &ProcessSupervisor,
) -> Result<Session> {
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let key = request.target.key();
    let span = info_span!(
        "launch_session",
        session_id,
        target_key = %key,
        provider = request.provider,
        agent_type = request.agent_type.as_str()
    );

    async move {
        // Provider-level rejections happen before anything is claimed.
        let cli_session_id = request.resume_id.clone().or_else(|| {
            supervisor
                .providers()
                .assigns_session_id(&request.provider)
                .then(|| Uuid::new_v4().to_string())
        });
        let spec = request.spawn_spec(cli_session_id.clone());
        supervisor.providers().build_command(&spec)?;

        if guard.holder(&key).as_deref() == Some(session_id.as_str()) {
            return Err(AppError::Conflict(format!(
                "session {session_id} already exists"
            )));
        }
        guard.acquire(&key, &session_id)?;

        let session = Session::queued(
            session_id.clone(),
            &request.target,
            request.agent_type,
            request.provider.clone(),
        );
        if let Err(err) = lifecycle.create_queued(session).await {
            guard.release_held_by(&key, &session_id);
            return Err(err);
        }

        // A cancel may have landed since the row was created.
        match lifecycle.get(&session_id).await {
            Ok(current) if current.status == SessionStatus::Queued => {}
            Ok(current) => {
                info!(status = %current.status, "session left queued state before spawn");
                guard.release_held_by(&key, &session_id);
                return Err(AppError::InvalidTransition {
                    session_id,
                    current: current.status,
                    attempted: SessionStatus::Running,
                });
            }
            Err(err) => {
                abandon(lifecycle, guard, &key, &session_id, &err).await;
                return Err(err);
            }
        }

        if let Err(err) = supervisor.start(&session_id, &spec) {
            warn!(%err, "agent process failed to start");
            abandon(lifecycle, guard, &key, &session_id, &err).await;
            return Err(err);
        }

        match lifecycle
            .mark_running(&session_id, cli_session_id, Utc::now())
            .await
        {
            Ok(running) => {
                info!("session launched");
                Ok(running)
            }
            Err(err) => {
                warn!(%err, "session did not reach running, stopping process");
                if let Err(cancel_err) = supervisor.cancel(&session_id).await {
                    warn!(%cancel_err, "failed to stop orphaned process");
                }
                supervisor.remove(&session_id);
                // No-op when a cancel already made the session terminal.
                abandon(lifecycle, guard, &key, &session_id, &err).await;
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

/// Fail a launched session that cannot proceed. When even that cannot be
/// recorded, the target key is released directly so it never stays held.
async fn abandon(
    lifecycle: &LifecycleManager,
    guard: &ConcurrencyGuard,
    key: &TargetKey,
    session_id: &str,
    cause: &AppError,
) {
    let outcome = TerminalOutcome::failure(cause.to_string());
    match lifecycle.mark_terminal(session_id, outcome, Utc::now()).await {
        Ok(session) => debug!(status = %session.status, "launch abandoned"),
        Err(err) => {
            warn!(%err, "failed to record launch failure, releasing target");
            guard.release_held_by(key, session_id);
        }
    }
}
