//! Configuration for the coordination layer.
//!
//! Plain structs with serde support; how they get populated (files, env,
//! flags) is the embedding process's concern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use strata_core::LockConfig;

/// How a cached query status keeps itself fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Reads check staleness and refresh synchronously when the cached
    /// copy is too old; nothing happens otherwise.
    Lazy,
    /// A background task refreshes unconditionally on every interval;
    /// reads never refresh inline.
    Timer,
}

impl Default for RefreshMode {
    fn default() -> Self {
        Self::Lazy
    }
}

/// Tuning for [`crate::cached::CachedQueryStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum age a cached copy may reach before a read must refresh it
    /// (lazy mode) or the interval between background refreshes (timer
    /// mode).
    #[serde(with = "humantime_serde")]
    pub staleness: Duration,

    /// Refresh trigger.
    #[serde(default)]
    pub refresh: RefreshMode,

    /// Lease applied while holding the status lock during a refresh.
    #[serde(with = "humantime_serde")]
    pub lock_lease: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(5),
            refresh: RefreshMode::Lazy,
            lock_lease: Duration::from_secs(30),
        }
    }
}

/// Tuning for [`crate::storage_cache::QueryStorageCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCacheConfig {
    /// Cache tuning handed to [`crate::cached::CachedQueryStatus`]
    /// instances built by the orchestrator.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Lock tuning for entity locks.
    #[serde(skip)]
    pub lock: LockConfig,

    /// Concurrency ceiling applied when a caller doesn't pass one.
    #[serde(default = "default_max_running")]
    pub default_max_running: usize,
}

impl Default for StorageCacheConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            lock: LockConfig::default(),
            default_max_running: default_max_running(),
        }
    }
}

const fn default_max_running() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = StorageCacheConfig::default();
        assert_eq!(config.cache.refresh, RefreshMode::Lazy);
        assert_eq!(config.cache.staleness, Duration::from_secs(5));
        assert_eq!(config.default_max_running, 10);
    }

    #[test]
    fn deserializes_humantime_durations() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"staleness": "250ms", "lockLease": "10s"}"#).unwrap();
        assert_eq!(config.staleness, Duration::from_millis(250));
        assert_eq!(config.lock_lease, Duration::from_secs(10));
        assert_eq!(config.refresh, RefreshMode::Lazy);
    }
}
