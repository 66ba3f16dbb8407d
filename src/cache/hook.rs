//! Automatic invalidation on entity lifecycle events.
//!
//! An entity type opts in by implementing [`Cacheable`] and having an
//! [`InvalidationHook`] installed for it. When the entity is created,
//! updated, deleted or restored the hook invalidates its own kind plus every
//! related kind, unless configuration disables that event or the kind is
//! already being invalidated in the current [`InvalidationScope`].

use std::sync::Arc;

use tracing::{debug, warn};

use super::config::{AutoInvalidation, CacheConfig};
use super::diagnostics::{DiagnosticEvent, DiagnosticsSink};
use super::events::{LifecycleEvent, ModelEvent, ModelEvents, ModelListener};
use super::manager::Invalidation;
use super::scope::InvalidationScope;
use crate::error::CacheError;

/// Capability of an entity type whose queries are cached.
pub trait Cacheable {
    /// Cache kind of this entity, usually its type name.
    fn cache_kind() -> &'static str;

    /// Kinds whose cached data embeds this entity, e.g. `Post` for `Category`.
    fn related_invalidation_kinds() -> &'static [&'static str] {
        &[]
    }

    /// Entity-level opt-out, checked before configuration.
    fn auto_invalidates() -> bool {
        true
    }
}

/// Invalidates a batch of kinds. Implemented by [`super::CacheManager`].
pub trait Invalidator: Send + Sync {
    fn invalidate_kinds(&self, kinds: &[String])
    -> Result<Vec<(String, Invalidation)>, CacheError>;
}

#[derive(Debug)]
pub enum HookOutcome {
    /// Switched off for this kind or event.
    Disabled,
    /// The kind is already being invalidated in this scope.
    SkippedRecursive,
    Invalidated(Vec<(String, Invalidation)>),
    /// Reported, never propagated to the caller that saved the entity.
    Failed(CacheError),
}

pub struct InvalidationHook {
    kind: &'static str,
    targets: Vec<String>,
    switches: AutoInvalidation,
    invalidator: Arc<dyn Invalidator>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl InvalidationHook {
    /// Build the hook for `E`; switches are resolved once, here.
    pub fn install<E: Cacheable>(
        config: &CacheConfig,
        invalidator: Arc<dyn Invalidator>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let kind = E::cache_kind();
        let switches = if E::auto_invalidates() {
            config.auto_invalidation_for(kind)
        } else {
            AutoInvalidation::DISABLED
        };

        let mut targets = vec![kind.to_string()];
        for related in E::related_invalidation_kinds() {
            if !targets.iter().any(|target| target == related) {
                targets.push((*related).to_string());
            }
        }

        debug!(
            kind,
            targets = ?targets,
            enabled = switches.enabled,
            "Invalidation hook installed"
        );

        Self {
            kind,
            targets,
            switches,
            invalidator,
            sink,
        }
    }

    /// Install the hook for `E` and subscribe it to `events`.
    pub fn register<E: Cacheable>(
        events: &ModelEvents,
        config: &CacheConfig,
        invalidator: Arc<dyn Invalidator>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Arc<Self> {
        let hook = Arc::new(Self::install::<E>(config, invalidator, sink));
        events.subscribe(hook.kind, hook.clone());
        hook
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Own kind first, then related kinds in declaration order.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn switches(&self) -> AutoInvalidation {
        self.switches
    }

    pub fn handle(&self, scope: &InvalidationScope, event: LifecycleEvent) -> HookOutcome {
        if !self.switches.allows(event) {
            debug!(kind = self.kind, lifecycle = %event, "Automatic invalidation disabled");
            return HookOutcome::Disabled;
        }

        let Some(_guard) = scope.enter(self.kind) else {
            self.sink.record(&DiagnosticEvent::InvalidationSkippedRecursive {
                kind: self.kind.to_string(),
            });
            return HookOutcome::SkippedRecursive;
        };

        match self.invalidator.invalidate_kinds(&self.targets) {
            Ok(done) => HookOutcome::Invalidated(done),
            Err(err) => {
                warn!(
                    kind = self.kind,
                    lifecycle = %event,
                    failed = ?err.failed_kinds(),
                    error = %err,
                    "Automatic cache invalidation failed"
                );
                HookOutcome::Failed(err)
            }
        }
    }
}

impl ModelListener for InvalidationHook {
    fn on_model_event(&self, scope: &InvalidationScope, event: &ModelEvent) {
        let outcome = self.handle(scope, event.lifecycle);
        debug!(
            event_id = %event.id,
            kind = self.kind,
            outcome = ?outcome,
            "Lifecycle event handled"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock, Weak};

    use super::*;
    use crate::cache::config::{AutoInvalidationOverrides, ModelOverrides};
    use crate::cache::diagnostics::NoopSink;
    use crate::error::{InvalidationFailure, StoreError};

    struct Post;

    impl Cacheable for Post {
        fn cache_kind() -> &'static str {
            "Post"
        }
    }

    struct Category;

    impl Cacheable for Category {
        fn cache_kind() -> &'static str {
            "Category"
        }

        fn related_invalidation_kinds() -> &'static [&'static str] {
            &["Post", "Category", "City"]
        }
    }

    struct AuditLog;

    impl Cacheable for AuditLog {
        fn cache_kind() -> &'static str {
            "AuditLog"
        }

        fn auto_invalidates() -> bool {
            false
        }
    }

    #[derive(Default)]
    struct Spy {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl Invalidator for Spy {
        fn invalidate_kinds(
            &self,
            kinds: &[String],
        ) -> Result<Vec<(String, Invalidation)>, CacheError> {
            self.calls.lock().expect("spy lock").push(kinds.to_vec());
            Ok(kinds
                .iter()
                .map(|kind| (kind.clone(), Invalidation::VersionBumped(2)))
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DiagnosticEvent>>,
    }

    impl DiagnosticsSink for RecordingSink {
        fn record(&self, event: &DiagnosticEvent) {
            self.events.lock().expect("sink lock").push(event.clone());
        }
    }

    fn hook<E: Cacheable>(config: &CacheConfig, spy: &Arc<Spy>) -> InvalidationHook {
        InvalidationHook::install::<E>(config, spy.clone(), Arc::new(NoopSink))
    }

    #[test]
    fn related_kinds_are_invalidated_with_own_kind() {
        let spy = Arc::new(Spy::default());
        let hook = hook::<Category>(&CacheConfig::default(), &spy);
        assert_eq!(hook.targets(), ["Category", "Post", "City"]);

        let outcome = hook.handle(&InvalidationScope::new(), LifecycleEvent::Updated);
        let HookOutcome::Invalidated(done) = outcome else {
            panic!("expected invalidation, got {outcome:?}");
        };
        assert_eq!(done.len(), 3);
        assert_eq!(
            *spy.calls.lock().expect("lock"),
            vec![vec!["Category".to_string(), "Post".to_string(), "City".to_string()]]
        );
    }

    #[test]
    fn disabled_kind_never_calls_invalidator() {
        let mut config = CacheConfig::default();
        config.models.insert(
            "Post".to_string(),
            ModelOverrides {
                auto_invalidation: AutoInvalidationOverrides {
                    enabled: Some(false),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let spy = Arc::new(Spy::default());
        let hook = hook::<Post>(&config, &spy);

        for event in LifecycleEvent::ALL {
            assert!(matches!(
                hook.handle(&InvalidationScope::new(), event),
                HookOutcome::Disabled
            ));
        }
        assert!(spy.calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn single_event_can_be_switched_off() {
        let mut config = CacheConfig::default();
        config.auto_invalidation.on_create = false;
        let spy = Arc::new(Spy::default());
        let hook = hook::<Post>(&config, &spy);
        let scope = InvalidationScope::new();

        assert!(matches!(
            hook.handle(&scope, LifecycleEvent::Created),
            HookOutcome::Disabled
        ));
        assert!(matches!(
            hook.handle(&scope, LifecycleEvent::Deleted),
            HookOutcome::Invalidated(_)
        ));
        assert_eq!(spy.calls.lock().expect("lock").len(), 1);
    }

    #[test]
    fn entity_opt_out_overrides_config() {
        let spy = Arc::new(Spy::default());
        let hook = hook::<AuditLog>(&CacheConfig::default(), &spy);
        assert_eq!(hook.switches(), AutoInvalidation::DISABLED);
        assert!(matches!(
            hook.handle(&InvalidationScope::new(), LifecycleEvent::Updated),
            HookOutcome::Disabled
        ));
    }

    /// Saves the entity again from inside its own invalidation.
    struct Reentrant {
        hook: OnceLock<Weak<InvalidationHook>>,
        scope: Arc<InvalidationScope>,
        nested: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl Invalidator for Reentrant {
        fn invalidate_kinds(
            &self,
            kinds: &[String],
        ) -> Result<Vec<(String, Invalidation)>, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.hook.get().and_then(Weak::upgrade) {
                let nested = hook.handle(&self.scope, LifecycleEvent::Updated);
                self.nested
                    .lock()
                    .expect("nested lock")
                    .push(format!("{nested:?}"));
            }
            Ok(kinds
                .iter()
                .map(|kind| (kind.clone(), Invalidation::TagFlushed(true)))
                .collect())
        }
    }

    #[test]
    fn nested_save_of_same_kind_is_skipped() {
        let scope = Arc::new(InvalidationScope::new());
        let invalidator = Arc::new(Reentrant {
            hook: OnceLock::new(),
            scope: scope.clone(),
            nested: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let hook = Arc::new(InvalidationHook::install::<Post>(
            &CacheConfig::default(),
            invalidator.clone(),
            sink.clone(),
        ));
        assert!(invalidator.hook.set(Arc::downgrade(&hook)).is_ok());

        let outcome = hook.handle(&scope, LifecycleEvent::Updated);

        assert!(matches!(outcome, HookOutcome::Invalidated(_)));
        assert_eq!(invalidator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *invalidator.nested.lock().expect("lock"),
            vec!["SkippedRecursive".to_string()]
        );
        assert_eq!(
            *sink.events.lock().expect("lock"),
            vec![DiagnosticEvent::InvalidationSkippedRecursive {
                kind: "Post".to_string()
            }]
        );
        assert!(!scope.is_invalidating("Post"));
    }

    struct Exploding;

    impl Invalidator for Exploding {
        fn invalidate_kinds(
            &self,
            _kinds: &[String],
        ) -> Result<Vec<(String, Invalidation)>, CacheError> {
            panic!("store client panicked");
        }
    }

    #[test]
    fn panicking_invalidator_releases_scope() {
        let hook = InvalidationHook::install::<Post>(
            &CacheConfig::default(),
            Arc::new(Exploding),
            Arc::new(NoopSink),
        );
        let scope = InvalidationScope::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            hook.handle(&scope, LifecycleEvent::Deleted)
        }));

        assert!(result.is_err());
        assert!(!scope.is_invalidating("Post"));
    }

    struct Failing;

    impl Invalidator for Failing {
        fn invalidate_kinds(
            &self,
            kinds: &[String],
        ) -> Result<Vec<(String, Invalidation)>, CacheError> {
            Err(CacheError::InvalidationPartialFailure {
                failed: kinds
                    .iter()
                    .map(|kind| InvalidationFailure {
                        kind: kind.clone(),
                        error: StoreError::unavailable("connection refused"),
                    })
                    .collect(),
                invalidated: Vec::new(),
            })
        }
    }

    #[test]
    fn failures_are_reported_not_raised() {
        let hook = InvalidationHook::install::<Post>(
            &CacheConfig::default(),
            Arc::new(Failing),
            Arc::new(NoopSink),
        );
        let outcome = hook.handle(&InvalidationScope::new(), LifecycleEvent::Updated);
        let HookOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.failed_kinds(), vec!["Post"]);
    }

    #[test]
    fn registered_hook_reacts_to_dispatched_events() {
        let events = ModelEvents::new();
        let spy = Arc::new(Spy::default());
        let hook = InvalidationHook::register::<Category>(
            &events,
            &CacheConfig::default(),
            spy.clone(),
            Arc::new(NoopSink),
        );
        assert_eq!(hook.kind(), "Category");
        assert_eq!(events.listener_count("Category"), 1);

        events.restored::<Category>(&InvalidationScope::new());
        assert_eq!(spy.calls.lock().expect("lock").len(), 1);
    }
}
