//! Cache configuration.
//!
//! Resolved once at startup and injected into the manager and hooks. Per-kind
//! and per-environment overrides are looked up through pure functions on
//! [`CacheConfig`]; nothing re-reads configuration while serving requests.
//!
//! ```toml
//! [cache]
//! default_ttl_secs = 3600
//! hash_algorithm = "xxh64"
//!
//! [cache.models.Post]
//! ttl_secs = 600
//!
//! [cache.environments.local]
//! default_ttl_secs = 60
//! ```

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::events::LifecycleEvent;
use super::keys::HashAlgorithm;

/// Used when no default TTL is configured.
pub const FALLBACK_TTL: Duration = Duration::from_secs(3600);

const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_VERSION_TTL_SECS: u64 = 30 * 24 * 3600;
const DEFAULT_VERSION_PREFIX: &str = "cache_version:";
const DEFAULT_STORE_CAPACITY: usize = 10_000;

/// Which invalidation strategy the manager uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPreference {
    /// Tags when the store supports them, versions otherwise.
    #[default]
    Auto,
    Tags,
    Versions,
}

/// Switches deciding which lifecycle events invalidate caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoInvalidation {
    pub enabled: bool,
    pub on_create: bool,
    pub on_update: bool,
    pub on_delete: bool,
    pub on_restore: bool,
}

impl Default for AutoInvalidation {
    fn default() -> Self {
        Self {
            enabled: true,
            on_create: true,
            on_update: true,
            on_delete: true,
            on_restore: true,
        }
    }
}

impl AutoInvalidation {
    pub const DISABLED: Self = Self {
        enabled: false,
        on_create: false,
        on_update: false,
        on_delete: false,
        on_restore: false,
    };

    /// True when both the global switch and the event's own switch are on.
    pub fn allows(&self, event: LifecycleEvent) -> bool {
        self.enabled
            && match event {
                LifecycleEvent::Created => self.on_create,
                LifecycleEvent::Updated => self.on_update,
                LifecycleEvent::Deleted => self.on_delete,
                LifecycleEvent::Restored => self.on_restore,
            }
    }
}

/// Partial switches layered over the global ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AutoInvalidationOverrides {
    pub enabled: Option<bool>,
    pub on_create: Option<bool>,
    pub on_update: Option<bool>,
    pub on_delete: Option<bool>,
    pub on_restore: Option<bool>,
}

impl AutoInvalidationOverrides {
    pub fn apply(&self, base: AutoInvalidation) -> AutoInvalidation {
        AutoInvalidation {
            enabled: self.enabled.unwrap_or(base.enabled),
            on_create: self.on_create.unwrap_or(base.on_create),
            on_update: self.on_update.unwrap_or(base.on_update),
            on_delete: self.on_delete.unwrap_or(base.on_delete),
            on_restore: self.on_restore.unwrap_or(base.on_restore),
        }
    }
}

/// Per entity-kind overrides (`[cache.models.<Kind>]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelOverrides {
    pub ttl_secs: Option<u64>,
    pub auto_invalidation: AutoInvalidationOverrides,
}

/// Per deployment environment overrides (`[cache.environments.<env>]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvironmentOverrides {
    pub default_ttl_secs: Option<u64>,
    pub version_ttl_secs: Option<u64>,
    pub auto_invalidation: AutoInvalidationOverrides,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global entry TTL in seconds; 0 falls back to [`FALLBACK_TTL`].
    pub default_ttl_secs: u64,
    /// TTL of version counters; keep it well above every entry TTL.
    pub version_ttl_secs: u64,
    pub version_prefix: String,
    /// Prepended to every entry key.
    pub key_prefix: String,
    pub hash_algorithm: HashAlgorithm,
    pub strategy: StrategyPreference,
    /// Capacity of the in-memory backend.
    pub store_capacity: usize,
    pub auto_invalidation: AutoInvalidation,
    pub models: HashMap<String, ModelOverrides>,
    pub environments: HashMap<String, EnvironmentOverrides>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            version_ttl_secs: DEFAULT_VERSION_TTL_SECS,
            version_prefix: DEFAULT_VERSION_PREFIX.to_string(),
            key_prefix: String::new(),
            hash_algorithm: HashAlgorithm::default(),
            strategy: StrategyPreference::default(),
            store_capacity: DEFAULT_STORE_CAPACITY,
            auto_invalidation: AutoInvalidation::default(),
            models: HashMap::new(),
            environments: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Copy of this config with the overrides for `environment` applied.
    pub fn for_environment(&self, environment: &str) -> Self {
        let mut resolved = self.clone();
        let Some(overrides) = lookup(&self.environments, environment) else {
            return resolved;
        };

        if let Some(ttl) = overrides.default_ttl_secs {
            resolved.default_ttl_secs = ttl;
        }
        if let Some(ttl) = overrides.version_ttl_secs {
            resolved.version_ttl_secs = ttl;
        }
        resolved.auto_invalidation = overrides.auto_invalidation.apply(self.auto_invalidation);
        resolved
    }

    pub fn default_ttl(&self) -> Duration {
        match self.default_ttl_secs {
            0 => FALLBACK_TTL,
            secs => Duration::from_secs(secs),
        }
    }

    pub fn version_ttl(&self) -> Duration {
        Duration::from_secs(self.version_ttl_secs)
    }

    /// Overrides declared for `kind`; kind names match case-insensitively.
    pub fn model(&self, kind: &str) -> Option<&ModelOverrides> {
        lookup(&self.models, kind)
    }

    /// Entry TTL: explicit, then per-kind override, then global default.
    ///
    /// Never longer than the version TTL: an entry outliving its kind's
    /// counter could be served again once the counter restarts at 1.
    pub fn ttl_for(&self, kind: &str, explicit: Option<Duration>) -> Duration {
        let ttl = explicit.unwrap_or_else(|| {
            self.model(kind)
                .and_then(|model| model.ttl_secs)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.default_ttl())
        });
        match self.version_ttl_secs {
            0 => ttl,
            _ => ttl.min(self.version_ttl()),
        }
    }

    /// Effective auto-invalidation switches for `kind`.
    pub fn auto_invalidation_for(&self, kind: &str) -> AutoInvalidation {
        match self.model(kind) {
            Some(model) => model.auto_invalidation.apply(self.auto_invalidation),
            None => self.auto_invalidation,
        }
    }

    /// Store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

fn lookup<'a, V>(map: &'a HashMap<String, V>, name: &str) -> Option<&'a V> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}
