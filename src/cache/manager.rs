//! Cache manager facade.
//!
//! Builds keys, resolves TTLs, and picks one of two invalidation strategies
//! once at construction:
//!
//! - **Tags**: entries are tagged with their kind; invalidating drops the tag.
//! - **Versions**: every key embeds the kind's version counter; invalidating
//!   bumps the counter and leaves old entries to expire on their own.
//!
//! Reads degrade to a miss when the store fails. Writes and invalidations
//! surface the failure.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::config::{CacheConfig, StrategyPreference};
use super::diagnostics::{DiagnosticEvent, DiagnosticsSink, TracingSink};
use super::hook::Invalidator;
use super::keys::{KeyBuilder, ParameterBag};
use super::store::{CacheStore, MemoryStore, StoreCapabilities};
use super::version::VersionStore;
use crate::error::{CacheError, InvalidationFailure, StoreError};

const METRIC_HIT_TOTAL: &str = "classifieds_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "classifieds_cache_miss_total";
const METRIC_WRITE_TOTAL: &str = "classifieds_cache_write_total";
const METRIC_INVALIDATION_TOTAL: &str = "classifieds_cache_invalidation_total";
const METRIC_STORE_ERROR_TOTAL: &str = "classifieds_cache_store_error_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Tags,
    Versions,
}

impl Strategy {
    fn select(
        preference: StrategyPreference,
        capabilities: StoreCapabilities,
        backend: &str,
    ) -> Result<Self, CacheError> {
        match preference {
            StrategyPreference::Auto if capabilities.tags => Ok(Self::Tags),
            StrategyPreference::Auto | StrategyPreference::Versions => Ok(Self::Versions),
            StrategyPreference::Tags if capabilities.tags => Ok(Self::Tags),
            StrategyPreference::Tags => Err(CacheError::configuration(format!(
                "strategy `tags` requires tag support, which the `{backend}` store lacks"
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tags => f.write_str("tags"),
            Self::Versions => f.write_str("versions"),
        }
    }
}

/// Result of invalidating one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    /// Tag mode; whether any tagged entry existed.
    TagFlushed(bool),
    /// Version mode; the new version.
    VersionBumped(u64),
}

impl fmt::Display for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagFlushed(flushed) => write!(f, "tag flushed (entries present: {flushed})"),
            Self::VersionBumped(version) => write!(f, "version bumped to {version}"),
        }
    }
}

/// Diagnostic snapshot for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub kind: String,
    pub backend: String,
    pub strategy: Strategy,
    pub supports_tags: bool,
    /// Current version; `None` in tag mode.
    pub version: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct KindCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

pub struct CacheManager {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    keys: KeyBuilder,
    versions: VersionStore,
    capabilities: StoreCapabilities,
    strategy: Strategy,
    counters: DashMap<String, KindCounters>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl CacheManager {
    /// Read the capabilities of `store` once and build a manager over it.
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Result<Self, CacheError> {
        let capabilities = store.capabilities();
        let strategy = Strategy::select(config.strategy, capabilities, store.name())?;
        let keys = KeyBuilder::new(config.key_prefix.clone(), config.hash_algorithm);
        let versions = VersionStore::new(
            Arc::clone(&store),
            config.version_prefix.clone(),
            config.version_ttl(),
        );

        debug!(
            backend = store.name(),
            strategy = %strategy,
            hash_algorithm = %config.hash_algorithm,
            "Cache manager ready"
        );

        Ok(Self {
            config,
            store,
            keys,
            versions,
            capabilities,
            strategy,
            counters: DashMap::new(),
            sink: Arc::new(TracingSink),
        })
    }

    /// Manager over a full-featured [`MemoryStore`] sized from the config.
    pub fn in_memory(config: CacheConfig) -> Result<Self, CacheError> {
        let store = MemoryStore::new(config.store_capacity_non_zero());
        Self::new(config, Arc::new(store))
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Key an entry of `kind` with `params` is stored under right now.
    pub fn key(&self, kind: &str, params: &ParameterBag) -> Result<String, CacheError> {
        let fingerprint = self.keys.fingerprint(params)?;
        let version = self
            .current_version(kind)
            .map_err(|err| self.store_failure("key", kind, err))?;
        Ok(self.keys.key_for_fingerprint(kind, &fingerprint, version))
    }

    /// Cached value, or `None` on a miss.
    ///
    /// Store failures and undecodable payloads count as misses.
    pub fn get<T: DeserializeOwned>(
        &self,
        kind: &str,
        params: &ParameterBag,
    ) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.fetch(kind, params, "get")? else {
            self.record_miss(kind);
            return Ok(None);
        };

        match serde_json::from_slice(&raw) {
            Ok(value) => {
                self.record_hit(kind);
                Ok(Some(value))
            }
            Err(err) => {
                warn!(kind, error = %err, "Cached payload could not be decoded; treating as miss");
                self.record_miss(kind);
                Ok(None)
            }
        }
    }

    /// Store `value` and hand it back.
    pub fn put<T: Serialize>(
        &self,
        kind: &str,
        params: &ParameterBag,
        value: T,
        ttl: Option<Duration>,
    ) -> Result<T, CacheError> {
        let payload =
            serde_json::to_vec(&value).map_err(|err| CacheError::serialization(err.to_string()))?;
        self.write_payload(kind, params, payload, ttl)?;
        Ok(value)
    }

    /// Cached value, or the producer's result stored for next time.
    ///
    /// The producer only runs on a miss. Concurrent misses may each run it.
    /// A failed store write is reported but the produced value is still
    /// returned, since it is fresh.
    #[instrument(level = "debug", skip_all, fields(kind = kind))]
    pub fn remember<T, F>(
        &self,
        kind: &str,
        params: &ParameterBag,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        if let Some(cached) = self.get(kind, params)? {
            return Ok(cached);
        }
        let value = producer();
        self.store_produced(kind, params, value, ttl)
    }

    /// [`CacheManager::remember`] for fallible producers; errors are not cached.
    pub fn try_remember<T, E, F>(
        &self,
        kind: &str,
        params: &ParameterBag,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(cached) = self.get(kind, params)? {
            return Ok(cached);
        }
        let value = producer()?;
        Ok(self.store_produced(kind, params, value, ttl)?)
    }

    fn store_produced<T: Serialize>(
        &self,
        kind: &str,
        params: &ParameterBag,
        value: T,
        ttl: Option<Duration>,
    ) -> Result<T, CacheError> {
        let payload =
            serde_json::to_vec(&value).map_err(|err| CacheError::serialization(err.to_string()))?;
        match self.write_payload(kind, params, payload, ttl) {
            Ok(()) => Ok(value),
            Err(CacheError::StoreUnavailable { source, .. }) => {
                warn!(kind, error = %source, "Produced value was not cached");
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    fn write_payload(
        &self,
        kind: &str,
        params: &ParameterBag,
        payload: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let fingerprint = self.keys.fingerprint(params)?;
        let version = self
            .current_version(kind)
            .map_err(|err| self.store_failure("put", kind, err))?;
        let key = self.keys.key_for_fingerprint(kind, &fingerprint, version);
        let ttl = self.config.ttl_for(kind, ttl);
        let written = match version {
            None => self.store.tag_set(&key, payload, ttl, &[kind]),
            // the counter must outlive the entry, or a reset would revive it
            Some(version) => self
                .store
                .set(&key, payload, ttl)
                .and_then(|()| self.versions.touch(kind, version)),
        };
        written.map_err(|err| self.store_failure("put", kind, err))?;

        self.counters_for(kind).writes.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_WRITE_TOTAL, "kind" => kind.to_string()).increment(1);
        debug!(kind, ttl_secs = ttl.as_secs(), "Cache entry stored");
        Ok(())
    }

    /// Whether an entry exists. Touches neither its TTL nor its recency.
    pub fn has(&self, kind: &str, params: &ParameterBag) -> Result<bool, CacheError> {
        let Some(key) = self.read_key(kind, params, "has")? else {
            return Ok(false);
        };
        match self.store.contains(&key) {
            Ok(found) => Ok(found),
            Err(err) => {
                self.report_store_failure("has", kind, &err);
                Ok(false)
            }
        }
    }

    /// Remove one entry; returns whether something was removed.
    pub fn forget(&self, kind: &str, params: &ParameterBag) -> Result<bool, CacheError> {
        let key = self.key(kind, params)?;
        let removed = self
            .store
            .delete(&key)
            .map_err(|err| self.store_failure("forget", kind, err))?;
        debug!(kind, removed, "Cache entry forgotten");
        Ok(removed)
    }

    /// Make every entry of `kind` unreachable.
    #[instrument(level = "debug", skip(self))]
    pub fn invalidate(&self, kind: &str) -> Result<Invalidation, CacheError> {
        self.invalidate_kind(kind)
            .map_err(|err| self.store_failure("invalidate", kind, err))
    }

    /// Invalidate each kind, continuing past failures.
    ///
    /// Any failure yields [`CacheError::InvalidationPartialFailure`] listing
    /// the failed kinds alongside the ones that did get invalidated.
    pub fn invalidate_multiple<S: AsRef<str>>(
        &self,
        kinds: &[S],
    ) -> Result<Vec<(String, Invalidation)>, CacheError> {
        let mut done = Vec::with_capacity(kinds.len());
        let mut failed = Vec::new();

        for kind in kinds {
            let kind = kind.as_ref();
            match self.invalidate_kind(kind) {
                Ok(outcome) => done.push((kind.to_string(), outcome)),
                Err(err) => {
                    self.report_store_failure("invalidate", kind, &err);
                    failed.push(InvalidationFailure {
                        kind: kind.to_string(),
                        error: err,
                    });
                }
            }
        }

        if failed.is_empty() {
            Ok(done)
        } else {
            Err(CacheError::InvalidationPartialFailure {
                failed,
                invalidated: done.into_iter().map(|(kind, _)| kind).collect(),
            })
        }
    }

    fn invalidate_kind(&self, kind: &str) -> Result<Invalidation, StoreError> {
        let outcome = match self.strategy {
            Strategy::Tags => self.store.flush_tag(kind).map(Invalidation::TagFlushed),
            Strategy::Versions => self
                .versions
                .bump_version(kind)
                .map(Invalidation::VersionBumped),
        }?;

        self.counters_for(kind)
            .invalidations
            .fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_INVALIDATION_TOTAL, "kind" => kind.to_string()).increment(1);
        self.sink.record(&DiagnosticEvent::Invalidated {
            kind: kind.to_string(),
            detail: outcome.to_string(),
        });
        Ok(outcome)
    }

    /// Diagnostic snapshot for `kind`.
    pub fn stats(&self, kind: &str) -> Result<CacheStats, CacheError> {
        let version = self
            .current_version(kind)
            .map_err(|err| self.store_failure("stats", kind, err))?;
        let (hits, misses, writes, invalidations) = match self.counters.get(kind) {
            Some(counters) => (
                counters.hits.load(Ordering::Relaxed),
                counters.misses.load(Ordering::Relaxed),
                counters.writes.load(Ordering::Relaxed),
                counters.invalidations.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0, 0),
        };

        Ok(CacheStats {
            kind: kind.to_string(),
            backend: self.store.name().to_string(),
            strategy: self.strategy,
            supports_tags: self.capabilities.tags,
            version,
            hits,
            misses,
            writes,
            invalidations,
        })
    }

    fn current_version(&self, kind: &str) -> Result<Option<u64>, StoreError> {
        match self.strategy {
            Strategy::Tags => Ok(None),
            Strategy::Versions => self.versions.get_version(kind).map(Some),
        }
    }

    /// Key for the read path; `None` when the version cannot be read.
    fn read_key(
        &self,
        kind: &str,
        params: &ParameterBag,
        operation: &'static str,
    ) -> Result<Option<String>, CacheError> {
        let fingerprint = self.keys.fingerprint(params)?;
        match self.current_version(kind) {
            Ok(version) => Ok(Some(
                self.keys.key_for_fingerprint(kind, &fingerprint, version),
            )),
            Err(err) => {
                self.report_store_failure(operation, kind, &err);
                Ok(None)
            }
        }
    }

    /// Raw payload for the read path; store failures become `None`.
    fn fetch(
        &self,
        kind: &str,
        params: &ParameterBag,
        operation: &'static str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(key) = self.read_key(kind, params, operation)? else {
            return Ok(None);
        };
        match self.store.get(&key) {
            Ok(raw) => Ok(raw),
            Err(err) => {
                self.report_store_failure(operation, kind, &err);
                Ok(None)
            }
        }
    }

    fn record_hit(&self, kind: &str) {
        self.counters_for(kind).hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT_TOTAL, "kind" => kind.to_string()).increment(1);
        debug!(kind, outcome = "hit", "Cache lookup");
    }

    fn record_miss(&self, kind: &str) {
        self.counters_for(kind).misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS_TOTAL, "kind" => kind.to_string()).increment(1);
        debug!(kind, outcome = "miss", "Cache lookup");
    }

    fn counters_for(&self, kind: &str) -> dashmap::mapref::one::Ref<'_, String, KindCounters> {
        if let Some(counters) = self.counters.get(kind) {
            return counters;
        }
        self.counters.entry(kind.to_string()).or_default().downgrade()
    }

    /// Report a store failure and wrap it for the caller.
    fn store_failure(&self, operation: &'static str, kind: &str, err: StoreError) -> CacheError {
        self.report_store_failure(operation, kind, &err);
        CacheError::store(operation, err)
    }

    fn report_store_failure(&self, operation: &'static str, kind: &str, err: &StoreError) {
        counter!(METRIC_STORE_ERROR_TOTAL, "operation" => operation).increment(1);
        self.sink.record(&DiagnosticEvent::StoreUnavailable {
            operation,
            kind: kind.to_string(),
            reason: err.to_string(),
        });
    }
}

impl Invalidator for CacheManager {
    fn invalidate_kinds(
        &self,
        kinds: &[String],
    ) -> Result<Vec<(String, Invalidation)>, CacheError> {
        self.invalidate_multiple(kinds)
    }
}
