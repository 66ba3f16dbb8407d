//! Backing store contract and the in-process reference backend.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use serde::Serialize;

use super::lock::{LockSite, lock_mutex};
use super::tags::TagIndex;
use crate::error::StoreError;

const SOURCE: &str = "cache::store";
const METRIC_EVICT_TOTAL: &str = "classifieds_cache_evict_total";

/// What a backend can do beyond plain get/set/delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCapabilities {
    /// Entries can be tagged and a whole tag dropped at once.
    pub tags: bool,
    /// `increment` is a single atomic operation.
    pub atomic_increment: bool,
}

impl StoreCapabilities {
    pub const FULL: Self = Self {
        tags: true,
        atomic_increment: true,
    };

    pub const PLAIN: Self = Self {
        tags: false,
        atomic_increment: false,
    };
}

/// Key/value backend the cache manager writes through.
///
/// Optional operations default to [`StoreError::Unsupported`]; a backend
/// advertises the ones it implements through [`CacheStore::capabilities`].
pub trait CacheStore: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &str;

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::PLAIN
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Whether a live entry exists, without refreshing its TTL or recency.
    ///
    /// Falls back to `get`; backends that can peek should override it.
    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.get(key).map(|value| value.is_some())
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether an entry was removed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Write `value` only if the current value equals `expected` (`None` = absent).
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Atomically add one to a decimal counter, creating it at 1 when absent.
    fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Unsupported {
            operation: "increment",
        })
    }

    fn tag_set(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Duration,
        _tags: &[&str],
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported {
            operation: "tag_set",
        })
    }

    /// Drop every entry carrying `tag`. Returns whether anything was dropped.
    fn flush_tag(&self, _tag: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported {
            operation: "flush_tag",
        })
    }
}

struct StoredEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl StoredEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now
                .checked_add(ttl)
                .unwrap_or(now + Duration::from_secs(u32::MAX.into())),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory backend with per-entry expiry and LRU eviction.
///
/// Capabilities are configurable so the same backend can stand in for a
/// tag-capable store (Redis-like) or a plain one (file/database-like).
pub struct MemoryStore {
    capabilities: StoreCapabilities,
    entries: Mutex<LruCache<String, StoredEntry>>,
    tags: TagIndex,
}

impl MemoryStore {
    /// Full-featured store holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self::with_capabilities(capacity, StoreCapabilities::FULL)
    }

    pub fn with_capabilities(capacity: NonZeroUsize, capabilities: StoreCapabilities) -> Self {
        Self {
            capabilities,
            entries: Mutex::new(LruCache::new(capacity)),
            tags: TagIndex::new(),
        }
    }

    pub fn len(&self) -> usize {
        lock_mutex(&self.entries, LockSite::new(SOURCE, "len")).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = lock_mutex(&self.entries, LockSite::new(SOURCE, "clear"));
        entries.clear();
        self.tags.clear();
    }

    /// Write `entry` and settle the key's tags under the same entries lock.
    ///
    /// Lock order is always entries, then tags.
    fn insert(&self, key: &str, entry: StoredEntry, tags: &[&str], op: &'static str) {
        let mut entries = lock_mutex(&self.entries, LockSite::new(SOURCE, op));
        let evicted = entries.push(key.to_string(), entry);
        self.tags.assign(key, tags);
        self.forget_evicted(key, evicted);
    }

    /// `push` hands back the displaced entry; only a different key is an eviction.
    /// Called with the entries lock held.
    fn forget_evicted(&self, key: &str, evicted: Option<(String, StoredEntry)>) {
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            self.tags.remove_key(&evicted_key);
            counter!(METRIC_EVICT_TOTAL).increment(1);
        }
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<(), StoreError> {
        if supported {
            Ok(())
        } else {
            Err(StoreError::Unsupported { operation })
        }
    }
}

impl CacheStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut entries = lock_mutex(&self.entries, LockSite::new(SOURCE, "get"));
        let expired = match entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            self.tags.remove_key(key);
        }
        Ok(None)
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let entries = lock_mutex(&self.entries, LockSite::new(SOURCE, "contains"));
        Ok(entries
            .peek(key)
            .is_some_and(|entry| entry.is_live(Instant::now())))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.insert(key, StoredEntry::new(value, ttl), &[], "set");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = lock_mutex(&self.entries, LockSite::new(SOURCE, "delete"));
        let removed = entries.pop(key);
        self.tags.remove_key(key);
        Ok(removed.is_some_and(|entry| entry.is_live(Instant::now())))
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = lock_mutex(&self.entries, LockSite::new(SOURCE, "compare_and_set"));
        let current = entries
            .peek(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.as_slice());
        if current != expected {
            return Ok(false);
        }
        let evicted = entries.push(key.to_string(), StoredEntry::new(value, ttl));
        self.forget_evicted(key, evicted);
        Ok(true)
    }

    /// Every increment restarts the counter's TTL.
    fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.require(self.capabilities.atomic_increment, "increment")?;

        let now = Instant::now();
        let mut entries = lock_mutex(&self.entries, LockSite::new(SOURCE, "increment"));
        let current = match entries.peek(key).filter(|entry| entry.is_live(now)) {
            Some(entry) => std::str::from_utf8(&entry.value)
                .map_err(|err| StoreError::corrupt(key, err.to_string()))?
                .parse::<u64>()
                .map_err(|err| StoreError::corrupt(key, err.to_string()))?,
            None => 0,
        };

        let next = current + 1;
        let entry = StoredEntry::new(next.to_string().into_bytes(), ttl);
        let evicted = entries.push(key.to_string(), entry);
        self.forget_evicted(key, evicted);
        Ok(next)
    }

    fn tag_set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[&str],
    ) -> Result<(), StoreError> {
        self.require(self.capabilities.tags, "tag_set")?;
        self.insert(key, StoredEntry::new(value, ttl), tags, "tag_set");
        Ok(())
    }

    fn flush_tag(&self, tag: &str) -> Result<bool, StoreError> {
        self.require(self.capabilities.tags, "flush_tag")?;
        let mut entries = lock_mutex(&self.entries, LockSite::new(SOURCE, "flush_tag"));
        let keys = self.tags.take_tag(tag);
        for key in &keys {
            entries.pop(key);
        }
        Ok(!keys.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn store() -> MemoryStore {
        MemoryStore::new(NonZeroUsize::new(16).expect("non-zero"))
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let store = store();
        assert!(store.get("k").expect("get").is_none());

        store.set("k", b"v".to_vec(), TTL).expect("set");
        assert_eq!(store.get("k").expect("get"), Some(b"v".to_vec()));

        assert!(store.delete("k").expect("delete"));
        assert!(!store.delete("k").expect("delete"));
        assert!(store.get("k").expect("get").is_none());
    }

    #[test]
    fn expired_entries_are_absent() {
        let store = store();
        store.set("k", b"v".to_vec(), Duration::ZERO).expect("set");
        assert!(store.get("k").expect("get").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn lru_evicts_oldest_and_forgets_its_tags() {
        let store = MemoryStore::new(NonZeroUsize::new(2).expect("non-zero"));
        store.tag_set("a", b"1".to_vec(), TTL, &["Post"]).expect("tag_set");
        store.tag_set("b", b"2".to_vec(), TTL, &["Post"]).expect("tag_set");
        store.tag_set("c", b"3".to_vec(), TTL, &["Post"]).expect("tag_set");

        assert!(store.get("a").expect("get").is_none());
        assert_eq!(store.tags.keys_for_tag("Post").len(), 2);
    }

    #[test]
    fn flush_tag_only_drops_tagged_entries() {
        let store = store();
        store.tag_set("post", b"1".to_vec(), TTL, &["Post"]).expect("tag_set");
        store.tag_set("cat", b"2".to_vec(), TTL, &["Category"]).expect("tag_set");

        assert!(store.flush_tag("Post").expect("flush"));
        assert!(!store.flush_tag("Post").expect("flush"));
        assert!(store.get("post").expect("get").is_none());
        assert!(store.get("cat").expect("get").is_some());
    }

    #[test]
    fn increment_creates_and_counts() {
        let store = store();
        assert_eq!(store.increment("v", TTL).expect("incr"), 1);
        assert_eq!(store.increment("v", TTL).expect("incr"), 2);
        assert_eq!(store.get("v").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn increment_restarts_counter_ttl() {
        let store = store();
        let ttl = Duration::from_millis(300);
        assert_eq!(store.increment("v", ttl).expect("incr"), 1);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(store.increment("v", ttl).expect("incr"), 2);
        thread::sleep(Duration::from_millis(200));

        assert_eq!(store.get("v").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn contains_leaves_recency_untouched() {
        let store = MemoryStore::new(NonZeroUsize::new(2).expect("non-zero"));
        store.set("a", b"1".to_vec(), TTL).expect("set");
        store.set("b", b"2".to_vec(), TTL).expect("set");

        assert!(store.contains("a").expect("contains"));
        store.set("c", b"3".to_vec(), TTL).expect("set");

        assert!(!store.contains("a").expect("contains"));
        assert!(store.contains("b").expect("contains"));
    }

    #[test]
    fn expired_entries_are_not_contained() {
        let store = store();
        store.set("k", b"v".to_vec(), Duration::ZERO).expect("set");
        assert!(!store.contains("k").expect("contains"));
    }

    #[test]
    fn retagged_key_after_expiry_is_flushed() {
        let store = store();
        store
            .tag_set("k", b"old".to_vec(), Duration::ZERO, &["Post"])
            .expect("tag_set");
        assert!(store.get("k").expect("get").is_none());

        store.tag_set("k", b"new".to_vec(), TTL, &["Post"]).expect("tag_set");
        assert!(store.flush_tag("Post").expect("flush"));
        assert!(store.get("k").expect("get").is_none());
    }

    #[test]
    fn concurrent_expiry_and_retag_keep_tags() {
        let store = Arc::new(store());
        for _ in 0..200 {
            store
                .tag_set("k", b"old".to_vec(), Duration::ZERO, &["Post"])
                .expect("tag_set");

            thread::scope(|scope| {
                let reader = Arc::clone(&store);
                scope.spawn(move || reader.get("k").expect("get"));
                let writer = Arc::clone(&store);
                scope.spawn(move || {
                    writer
                        .tag_set("k", b"new".to_vec(), TTL, &["Post"])
                        .expect("tag_set")
                });
            });

            store.flush_tag("Post").expect("flush");
            assert!(store.get("k").expect("get").is_none());
        }
    }

    #[test]
    fn increment_rejects_non_numeric_values() {
        let store = store();
        store.set("v", b"abc".to_vec(), TTL).expect("set");
        assert!(matches!(
            store.increment("v", TTL),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn compare_and_set_checks_current_value() {
        let store = store();
        assert!(store.compare_and_set("v", None, b"1".to_vec(), TTL).expect("cas"));
        assert!(!store.compare_and_set("v", None, b"1".to_vec(), TTL).expect("cas"));
        assert!(
            store
                .compare_and_set("v", Some(b"1"), b"2".to_vec(), TTL)
                .expect("cas")
        );
        assert_eq!(store.get("v").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn plain_store_refuses_optional_operations() {
        let store = MemoryStore::with_capabilities(
            NonZeroUsize::new(4).expect("non-zero"),
            StoreCapabilities::PLAIN,
        );
        assert!(matches!(
            store.increment("v", TTL),
            Err(StoreError::Unsupported { operation: "increment" })
        ));
        assert!(store.tag_set("k", Vec::new(), TTL, &["Post"]).is_err());
        assert!(store.flush_tag("Post").is_err());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.increment("counter", TTL).expect("incr");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(store.get("counter").expect("get"), Some(b"800".to_vec()));
    }
}
