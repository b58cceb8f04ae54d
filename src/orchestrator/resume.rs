//! Deciding whether a prior session can be resumed.

use super::provider::ProviderRegistry;
use crate::models::session::{AgentType, Session};
use crate::models::target::Target;
use crate::persistence::SessionStore;
use crate::Result;

/// Whether `prior` may be resumed for `requested`.
///
/// The provider must be resumable, the session must carry the CLI's
/// conversation id, it must no longer be live, and its scope must equal or
/// contain the requested one.
#[must_use]
pub fn is_resumable(prior: &Session, requested: &Target, providers: &ProviderRegistry) -> bool {
    providers.supports_resume(&prior.provider)
        && prior.cli_session_id.is_some()
        && !prior.status.is_live()
        && prior.target().covers(requested)
}

/// Newest prior session that can be resumed for `target`.
///
/// # Errors
///
/// Returns `AppError::Db` if the store query fails.
pub async fn find_resumable(
    store: &dyn SessionStore,
    providers: &ProviderRegistry,
    target: &Target,
    agent_type: Option<AgentType>,
) -> Result<Option<Session>> {
    let candidates = store.list_for_project(&target.project_id).await?;
    Ok(candidates.into_iter().find(|session| {
        agent_type.is_none_or(|wanted| session.agent_type == wanted)
            && is_resumable(session, target, providers)
    }))
}
