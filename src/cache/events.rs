//! Model lifecycle events.
//!
//! Entities report saves and deletes through [`ModelEvents`]. Listeners are
//! subscribed explicitly per entity kind at startup; the invalidation hook is
//! one such listener.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::config::CacheConfig;
use super::diagnostics::DiagnosticsSink;
use super::hook::{Cacheable, InvalidationHook, Invalidator};
use super::lock::{LockSite, read_lock, write_lock};
use super::scope::InvalidationScope;

const SOURCE: &str = "cache::events";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// Post-commit lifecycle signal of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Created,
    Updated,
    Deleted,
    Restored,
}

impl LifecycleEvent {
    pub const ALL: [Self; 4] = [Self::Created, Self::Updated, Self::Deleted, Self::Restored];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dispatched lifecycle event.
#[derive(Debug, Clone)]
pub struct ModelEvent {
    /// Unique identifier for correlating log lines.
    pub id: Uuid,
    pub epoch: Epoch,
    pub entity_kind: String,
    pub lifecycle: LifecycleEvent,
    pub timestamp: OffsetDateTime,
}

impl ModelEvent {
    pub fn new(entity_kind: impl Into<String>, lifecycle: LifecycleEvent, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            entity_kind: entity_kind.into(),
            lifecycle,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

pub trait ModelListener: Send + Sync {
    fn on_model_event(&self, scope: &InvalidationScope, event: &ModelEvent);
}

/// Per-kind listener registry.
#[derive(Default)]
pub struct ModelEvents {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn ModelListener>>>>,
    epoch_counter: AtomicU64,
}

impl ModelEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: impl Into<String>, listener: Arc<dyn ModelListener>) {
        write_lock(&self.listeners, LockSite::new(SOURCE, "subscribe"))
            .entry(kind.into())
            .or_default()
            .push(listener);
    }

    /// Register the invalidation hook of `E`; call once per entity type at startup.
    pub fn install_hook<E: Cacheable>(
        &self,
        config: &CacheConfig,
        invalidator: Arc<dyn Invalidator>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Arc<InvalidationHook> {
        InvalidationHook::register::<E>(self, config, invalidator, sink)
    }

    pub fn listener_count(&self, kind: &str) -> usize {
        read_lock(&self.listeners, LockSite::new(SOURCE, "listener_count"))
            .get(kind)
            .map_or(0, Vec::len)
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Deliver `lifecycle` for `kind` to every listener of that kind.
    pub fn dispatch(
        &self,
        scope: &InvalidationScope,
        kind: &str,
        lifecycle: LifecycleEvent,
    ) -> ModelEvent {
        let event = ModelEvent::new(kind, lifecycle, self.next_epoch());

        // Listeners may dispatch again; never hold the registry lock while calling them.
        let listeners = read_lock(&self.listeners, LockSite::new(SOURCE, "dispatch"))
            .get(kind)
            .cloned()
            .unwrap_or_default();

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            entity_kind = kind,
            lifecycle = %lifecycle,
            listeners = listeners.len(),
            "Model event dispatched"
        );

        for listener in listeners {
            listener.on_model_event(scope, &event);
        }
        event
    }

    pub fn created<E: Cacheable>(&self, scope: &InvalidationScope) -> ModelEvent {
        self.dispatch(scope, E::cache_kind(), LifecycleEvent::Created)
    }

    pub fn updated<E: Cacheable>(&self, scope: &InvalidationScope) -> ModelEvent {
        self.dispatch(scope, E::cache_kind(), LifecycleEvent::Updated)
    }

    pub fn deleted<E: Cacheable>(&self, scope: &InvalidationScope) -> ModelEvent {
        self.dispatch(scope, E::cache_kind(), LifecycleEvent::Deleted)
    }

    pub fn restored<E: Cacheable>(&self, scope: &InvalidationScope) -> ModelEvent {
        self.dispatch(scope, E::cache_kind(), LifecycleEvent::Restored)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, LifecycleEvent)>>,
    }

    impl ModelListener for Recorder {
        fn on_model_event(&self, _scope: &InvalidationScope, event: &ModelEvent) {
            self.seen
                .lock()
                .expect("recorder lock")
                .push((event.entity_kind.clone(), event.lifecycle));
        }
    }

    struct City;

    impl Cacheable for City {
        fn cache_kind() -> &'static str {
            "City"
        }
    }

    #[test]
    fn dispatch_reaches_only_listeners_of_that_kind() {
        let events = ModelEvents::new();
        let city = Arc::new(Recorder::default());
        let post = Arc::new(Recorder::default());
        events.subscribe("City", city.clone());
        events.subscribe("Post", post.clone());

        let scope = InvalidationScope::new();
        events.updated::<City>(&scope);
        events.deleted::<City>(&scope);

        assert_eq!(
            *city.seen.lock().expect("lock"),
            vec![
                ("City".to_string(), LifecycleEvent::Updated),
                ("City".to_string(), LifecycleEvent::Deleted)
            ]
        );
        assert!(post.seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn epochs_are_monotonic() {
        let events = ModelEvents::new();
        let scope = InvalidationScope::new();
        let first = events.created::<City>(&scope);
        let second = events.restored::<City>(&scope);
        assert!(first.epoch < second.epoch);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn dispatch_without_listeners_is_harmless() {
        let events = ModelEvents::new();
        let scope = InvalidationScope::new();
        let event = events.dispatch(&scope, "User", LifecycleEvent::Created);
        assert_eq!(event.entity_kind, "User");
        assert_eq!(events.listener_count("User"), 0);
    }

    #[test]
    fn lifecycle_names() {
        let names: Vec<_> = LifecycleEvent::ALL.iter().map(|e| e.as_str()).collect();
        assert_eq!(names, ["created", "updated", "deleted", "restored"]);
    }
}
