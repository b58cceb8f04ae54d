//! In-memory exclusivity table mapping target keys to the live session
//! holding them.
//!
//! Backed by a sharded [`DashMap`]: acquiring one key never blocks
//! acquisitions on keys in other shards, and the check-and-claim for a
//! single key happens under that key's shard lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::models::target::TargetKey;
use crate::{AppError, Result};

/// Registry of target keys held by queued or running sessions.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    holders: DashMap<TargetKey, String>,
}

impl ConcurrencyGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `session_id` if nobody else holds it.
    ///
    /// Re-acquiring a key already held by the same session succeeds.
    #[must_use]
    pub fn try_acquire(&self, key: &TargetKey, session_id: &str) -> bool {
        match self.holders.entry(key.clone()) {
            Entry::Occupied(held) => held.get() == session_id,
            Entry::Vacant(slot) => {
                slot.insert(session_id.to_owned());
                debug!(target_key = %key, session_id, "target acquired");
                true
            }
        }
    }

    /// Claim `key` or report who is holding it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyRunning` naming the holder when the key is
    /// taken by another session.
    pub fn acquire(&self, key: &TargetKey, session_id: &str) -> Result<()> {
        match self.holders.entry(key.clone()) {
            Entry::Occupied(held) if held.get() != session_id => Err(AppError::AlreadyRunning {
                target_key: key.to_string(),
                holding_session_id: held.get().clone(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(session_id.to_owned());
                debug!(target_key = %key, session_id, "target acquired");
                Ok(())
            }
        }
    }

    /// Remove the mapping for `key`. Releasing an unheld key is a no-op.
    pub fn release(&self, key: &TargetKey) {
        if let Some((_, holder)) = self.holders.remove(key) {
            debug!(target_key = %key, session_id = holder, "target released");
        }
    }

    /// Remove the mapping for `key` only if `session_id` holds it.
    ///
    /// Returns whether a mapping was removed.
    pub fn release_held_by(&self, key: &TargetKey, session_id: &str) -> bool {
        let removed = self
            .holders
            .remove_if(key, |_, holder| holder == session_id)
            .is_some();
        if removed {
            debug!(target_key = %key, session_id, "target released");
        }
        removed
    }

    /// Session currently holding `key`, if any.
    #[must_use]
    pub fn holder(&self, key: &TargetKey) -> Option<String> {
        self.holders.get(key).map(|held| held.value().clone())
    }

    /// Number of held keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Whether no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
