#![allow(dead_code)]

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use classifieds_cache::cache::{CacheStore, MemoryStore, StoreCapabilities};
use classifieds_cache::error::StoreError;

/// Memory store that can be taken down, or made to fail for chosen kinds.
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
    failing: Mutex<HashSet<String>>,
    pub writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(capabilities: StoreCapabilities) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::with_capabilities(
                NonZeroUsize::new(1024).expect("non-zero"),
                capabilities,
            ),
            down: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make every operation touching `needle` fail; matches tags and key substrings.
    pub fn fail_for(&self, needle: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(needle.to_string());
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection refused"));
        }
        let failing = self.failing.lock().expect("failing lock");
        if failing.iter().any(|needle| key.contains(needle.as_str())) {
            return Err(StoreError::unavailable(format!("injected failure for `{key}`")));
        }
        Ok(())
    }
}

impl CacheStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(key)?;
        self.inner.get(key)
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.check(key)?;
        self.inner.contains(key)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.check(key)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check(key)?;
        self.inner.delete(key)
    }

    fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.check(key)?;
        self.inner.increment(key, ttl)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check(key)?;
        self.inner.compare_and_set(key, expected, value, ttl)
    }

    fn tag_set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[&str],
    ) -> Result<(), StoreError> {
        self.check(key)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.tag_set(key, value, ttl, tags)
    }

    fn flush_tag(&self, tag: &str) -> Result<bool, StoreError> {
        self.check(tag)?;
        self.inner.flush_tag(tag)
    }
}
