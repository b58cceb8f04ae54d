//! Project-keyed publish/subscribe.
//!
//! Delivery is synchronous, in subscription order, and best-effort: there
//! is no buffering, so a subscriber registered after an emit never sees
//! that event. Each handler call is isolated; an error or panic in one
//! handler is logged and delivery continues with the next.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{debug, warn};

use crate::models::event::Event;
use crate::Result;

/// Callback invoked for each event on a subscribed project.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, Vec<Registration>>>,
}

impl BusInner {
    fn remove(&self, project_id: &str, id: u64) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(project_id) {
            list.retain(|registration| registration.id != id);
            if list.is_empty() {
                subscribers.remove(project_id);
            }
        }
    }
}

/// In-memory event bus. Cloning shares the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events routed to `project_id`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, project_id: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let project_id = project_id.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(project_id.clone())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });
        debug!(project_id, subscription_id = id, "bus subscriber added");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            project_id,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver `event` to every handler subscribed to its project.
    ///
    /// Returns how many handlers accepted the event.
    pub fn emit(&self, event: &Event) -> usize {
        // Snapshot handlers so none runs under the table lock; a handler may
        // unsubscribe itself or others while being called.
        let handlers: Vec<(u64, EventHandler)> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match subscribers.get(&event.project_id) {
                Some(list) => list
                    .iter()
                    .map(|registration| (registration.id, Arc::clone(&registration.handler)))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    warn!(
                        %err,
                        subscription_id = id,
                        event_type = event.event_type.as_str(),
                        "event handler failed"
                    );
                }
                Err(_) => {
                    warn!(
                        subscription_id = id,
                        event_type = event.event_type.as_str(),
                        "event handler panicked"
                    );
                }
            }
        }
        delivered
    }

    /// Number of handlers subscribed to `project_id`.
    #[must_use]
    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
            .map_or(0, Vec::len)
    }
}

/// Handle that keeps a bus handler registered.
///
/// Unsubscribing runs at most once, whether triggered explicitly, by drop,
/// or both.
pub struct Subscription {
    bus: Weak<BusInner>,
    project_id: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the handler from the bus. Later calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.project_id, self.id);
            debug!(
                project_id = self.project_id,
                subscription_id = self.id,
                "bus subscriber removed"
            );
        }
    }

    /// Whether the handler is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("project_id", &self.project_id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
