//! Per-kind version counters for stores without tag support.
//!
//! Every key built in version mode embeds the current counter of its kind.
//! Bumping the counter makes all earlier keys unreachable without touching
//! them; the orphaned entries age out through their own TTL.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::keys::escape_kind;
use super::store::CacheStore;
use crate::error::StoreError;

const INITIAL_VERSION: u64 = 1;
const MAX_CAS_ATTEMPTS: u32 = 64;

pub struct VersionStore {
    store: Arc<dyn CacheStore>,
    prefix: String,
    ttl: Duration,
    atomic_increment: bool,
}

impl VersionStore {
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        let atomic_increment = store.capabilities().atomic_increment;
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            atomic_increment,
        }
    }

    /// Store key holding the counter of `kind`.
    pub fn key_for(&self, kind: &str) -> String {
        format!("{}{}", self.prefix, escape_kind(kind))
    }

    /// Current version of `kind`, initialising it to 1 when absent.
    pub fn get_version(&self, kind: &str) -> Result<u64, StoreError> {
        let key = self.key_for(kind);
        for _ in 0..MAX_CAS_ATTEMPTS {
            if let Some(raw) = self.store.get(&key)? {
                return parse_version(&key, &raw);
            }

            let initial = INITIAL_VERSION.to_string().into_bytes();
            if self.store.compare_and_set(&key, None, initial, self.ttl)? {
                debug!(kind, version = INITIAL_VERSION, "Cache version initialised");
                return Ok(INITIAL_VERSION);
            }
        }

        Err(StoreError::Contention {
            key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Increment the version of `kind` and return the new value.
    ///
    /// The result is always above the version observed at the start, even if
    /// the counter expired in between. Every bump restarts the counter's TTL.
    pub fn bump_version(&self, kind: &str) -> Result<u64, StoreError> {
        let observed = self.get_version(kind)?;
        let key = self.key_for(kind);

        let mut version = if self.atomic_increment {
            self.store.increment(&key, self.ttl)?
        } else {
            self.bump_with_cas(&key, observed)?
        };
        if version <= observed {
            warn!(kind, observed, version, "Cache version counter expired during bump");
            version = self.bump_with_cas(&key, observed)?;
        }

        debug!(kind, version, "Cache version bumped");
        Ok(version)
    }

    /// Keep the counter of `kind` alive for another full TTL.
    ///
    /// Called whenever an entry keyed on `version` is written, so the counter
    /// outlives every entry built from it. A counter that vanished or fell
    /// below `version` is restored to `version`; a higher one is left alone.
    pub fn touch(&self, kind: &str, version: u64) -> Result<(), StoreError> {
        let key = self.key_for(kind);
        let value = version.to_string().into_bytes();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key)?;
            if let Some(raw) = current.as_deref()
                && parse_version(&key, raw)? > version
            {
                return Ok(());
            }
            if self
                .store
                .compare_and_set(&key, current.as_deref(), value.clone(), self.ttl)?
            {
                return Ok(());
            }
        }

        Err(StoreError::Contention {
            key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// CAS bump that never lands at or below `floor`.
    fn bump_with_cas(&self, key: &str, floor: u64) -> Result<u64, StoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get(key)?;
            let value = match current.as_deref() {
                Some(raw) => parse_version(key, raw)?.max(floor),
                None => floor,
            };

            let next = value + 1;
            if self.store.compare_and_set(
                key,
                current.as_deref(),
                next.to_string().into_bytes(),
                self.ttl,
            )? {
                return Ok(next);
            }

            if attempt % 16 == 0 {
                warn!(key, attempt, "Cache version bump still contended");
            }
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

fn parse_version(key: &str, raw: &[u8]) -> Result<u64, StoreError> {
    let text = std::str::from_utf8(raw).map_err(|err| StoreError::corrupt(key, err.to_string()))?;
    match text.trim().parse::<u64>() {
        Ok(0) => Err(StoreError::corrupt(key, "version must be at least 1")),
        Ok(version) => Ok(version),
        Err(err) => Err(StoreError::corrupt(key, err.to_string())),
    }
}
