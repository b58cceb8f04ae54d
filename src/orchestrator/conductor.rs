//! Orchestrator context.
//!
//! Owns one instance of each collaborator and wires them together. Nothing
//! here is global; tests build a fresh context per case.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::child_monitor::spawn_session_watcher;
use super::guard::ConcurrencyGuard;
use super::recovery::{self, ReconcileReport};
use super::resume;
use super::session_manager::LifecycleManager;
use super::spawner::{launch_session, LaunchRequest};
use super::supervisor::ProcessSupervisor;
use crate::config::GlobalConfig;
use crate::events::EventBus;
use crate::models::session::{AgentType, Session, SessionStatus};
use crate::models::target::Target;
use crate::persistence::SessionStore;
use crate::{AppError, Result};

/// Session orchestration entry point.
pub struct Orchestrator {
    config: Arc<GlobalConfig>,
    store: Arc<dyn SessionStore>,
    guard: Arc<ConcurrencyGuard>,
    bus: EventBus,
    supervisor: Arc<ProcessSupervisor>,
    lifecycle: Arc<LifecycleManager>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Orchestrator {
    /// Build a context with fresh guard, bus and supervisor.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, store: Arc<dyn SessionStore>) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::from_config(&config));
        Self::with_parts(
            config,
            store,
            Arc::new(ConcurrencyGuard::new()),
            EventBus::new(),
            supervisor,
        )
    }

    /// Build a context over explicit collaborators.
    #[must_use]
    pub fn with_parts(
        config: Arc<GlobalConfig>,
        store: Arc<dyn SessionStore>,
        guard: Arc<ConcurrencyGuard>,
        bus: EventBus,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&guard),
            bus.clone(),
            Arc::clone(&supervisor),
        ));
        Self {
            config,
            store,
            guard,
            bus,
            supervisor,
            lifecycle,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Event bus shared by every component.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Target exclusivity table.
    #[must_use]
    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Lifecycle manager.
    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Session store.
    #[must_use]
    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// Launch a session and start watching its process.
    ///
    /// # Errors
    ///
    /// Propagates launch failures (see [`launch_session`]); refuses new work
    /// with `AppError::Spawn` once shutdown has begun.
    pub async fn launch(&self, request: LaunchRequest) -> Result<Session> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Spawn("orchestrator is shutting down".into()));
        }
        let session =
            launch_session(request, &self.guard, &self.lifecycle, &self.supervisor).await?;
        self.watch(&session.id);
        Ok(session)
    }

    /// Cancel a session.
    ///
    /// # Errors
    ///
    /// See [`LifecycleManager::cancel`].
    pub async fn cancel(&self, id: &str) -> Result<Session> {
        self.lifecycle.cancel(id).await
    }

    /// Load a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id.
    pub async fn session(&self, id: &str) -> Result<Session> {
        self.lifecycle.get(id).await
    }

    /// Sessions of a project, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store query fails.
    pub async fn list(&self, project_id: &str, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        let sessions = self.store.list_for_project(project_id).await?;
        Ok(match status {
            Some(status) => sessions.into_iter().filter(|s| s.status == status).collect(),
            None => sessions,
        })
    }

    /// Newest prior session that can be resumed for `target`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store query fails.
    pub async fn resumable_session(
        &self,
        target: &Target,
        agent_type: Option<AgentType>,
    ) -> Result<Option<Session>> {
        resume::find_resumable(
            self.store.as_ref(),
            self.supervisor.providers(),
            target,
            agent_type,
        )
        .await
    }

    /// Resolve sessions left live by a previous run. Call before serving.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be listed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        recovery::reconcile(&self.lifecycle, &self.supervisor).await
    }

    /// Stop accepting work, cancel in-flight sessions, and wait for the
    /// watchers to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();

        // Cancels run concurrently; each may wait out the grace period.
        let live = self.supervisor.tracked_sessions();
        let cancels = live.iter().map(|id| self.lifecycle.cancel(id));
        for (id, outcome) in live.iter().zip(join_all(cancels).await) {
            if let Err(err) = outcome {
                warn!(session_id = id, %err, "failed to cancel session during shutdown");
            }
            self.supervisor.remove(id);
        }

        self.tasks.wait().await;
        info!(cancelled = live.len(), "orchestrator shut down");
    }

    fn watch(&self, session_id: &str) {
        spawn_session_watcher(
            session_id.to_owned(),
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.supervisor),
            self.config.poll_interval(),
            self.cancel.child_token(),
            &self.tasks,
        );
    }
}
