use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Where a lock is taken, for the poisoned-lock warning.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockSite {
    pub module: &'static str,
    pub op: &'static str,
}

impl LockSite {
    pub(crate) const fn new(module: &'static str, op: &'static str) -> Self {
        Self { module, op }
    }
}

fn recover<G>(result: LockResult<G>, site: LockSite, lock_kind: &'static str) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            op = site.op,
            target_module = site.module,
            lock_kind,
            result = "poisoned_recovered",
            "Recovered from poisoned cache lock"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn lock_mutex<T>(mutex: &Mutex<T>, site: LockSite) -> MutexGuard<'_, T> {
    recover(mutex.lock(), site, "mutex.lock")
}

pub(crate) fn read_lock<T>(rw: &RwLock<T>, site: LockSite) -> RwLockReadGuard<'_, T> {
    recover(rw.read(), site, "rwlock.read")
}

pub(crate) fn write_lock<T>(rw: &RwLock<T>, site: LockSite) -> RwLockWriteGuard<'_, T> {
    recover(rw.write(), site, "rwlock.write")
}
