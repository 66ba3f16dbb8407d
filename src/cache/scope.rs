//! Request-scoped recursion guard.
//!
//! One [`InvalidationScope`] lives for the duration of a request (or any other
//! unit of work) and is passed down to every lifecycle dispatch. It records
//! which entity kinds are currently being invalidated so that a save triggered
//! from inside an invalidation does not re-enter it.

use std::collections::HashSet;
use std::sync::Mutex;

use super::lock::{LockSite, lock_mutex};

const SOURCE: &str = "cache::scope";

#[derive(Debug, Default)]
pub struct InvalidationScope {
    active: Mutex<HashSet<String>>,
}

impl InvalidationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `kind` as invalidating. Returns `None` when it already is.
    ///
    /// The mark is cleared when the returned guard drops, including while
    /// unwinding from a panic.
    pub fn enter(&self, kind: &str) -> Option<ScopeGuard<'_>> {
        let inserted =
            lock_mutex(&self.active, LockSite::new(SOURCE, "enter")).insert(kind.to_string());
        inserted.then(|| ScopeGuard {
            scope: self,
            kind: kind.to_string(),
        })
    }

    pub fn is_invalidating(&self, kind: &str) -> bool {
        lock_mutex(&self.active, LockSite::new(SOURCE, "is_invalidating")).contains(kind)
    }

    /// Kinds currently marked, for diagnostics.
    pub fn active_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = lock_mutex(&self.active, LockSite::new(SOURCE, "active_kinds"))
            .iter()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

/// Run `f` with a fresh scope, e.g. once per request.
pub fn with_scope<R>(f: impl FnOnce(&InvalidationScope) -> R) -> R {
    let scope = InvalidationScope::new();
    f(&scope)
}

#[must_use = "the kind is released as soon as the guard drops"]
pub struct ScopeGuard<'a> {
    scope: &'a InvalidationScope,
    kind: String,
}

impl ScopeGuard<'_> {
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        lock_mutex(&self.scope.active, LockSite::new(SOURCE, "release")).remove(&self.kind);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn second_enter_for_same_kind_is_refused() {
        let scope = InvalidationScope::new();
        let guard = scope.enter("Post").expect("first enter");
        assert!(scope.enter("Post").is_none());
        assert!(scope.enter("Category").is_some());
        assert_eq!(guard.kind(), "Post");
    }

    #[test]
    fn guard_drop_releases_kind() {
        let scope = InvalidationScope::new();
        {
            let _guard = scope.enter("Post").expect("enter");
            assert!(scope.is_invalidating("Post"));
        }
        assert!(!scope.is_invalidating("Post"));
        assert!(scope.enter("Post").is_some());
    }

    #[test]
    fn guard_is_released_on_panic() {
        let scope = InvalidationScope::new();
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = scope.enter("Post").expect("enter");
            panic!("invalidation blew up");
        }));
        assert!(!scope.is_invalidating("Post"));
        assert!(scope.active_kinds().is_empty());
    }

    #[test]
    fn scopes_are_independent() {
        let first = InvalidationScope::new();
        let second = InvalidationScope::new();
        let _guard = first.enter("Post").expect("enter");
        assert!(second.enter("Post").is_some());
    }

    #[test]
    fn with_scope_provides_fresh_scope() {
        let kinds = with_scope(|scope| {
            let _a = scope.enter("User").expect("enter");
            let _b = scope.enter("City").expect("enter");
            scope.active_kinds()
        });
        assert_eq!(kinds, vec!["City".to_string(), "User".to_string()]);
    }
}
