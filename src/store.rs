//! Counter store: the shared state backing every rate-limit decision.
//!
//! The [`CounterBackend`] trait is the storage seam: a key/value counter
//! service with increment, get, set-with-expiry, and set-if-absent. Two
//! backends ship with the crate:
//! - [`MemoryBackend`]: per-process map with TTL semantics.
//! - [`RedisBackend`]: any Redis-protocol-speaking service.
//!
//! [`CounterStore`] is what the engine actually talks to. It tries the
//! primary backend first and falls back transparently to the in-process map
//! on any error, logging the failure instead of propagating it. Under a
//! backing-cache outage rate limits therefore become per-process rather than
//! global — the system fails open toward availability, never closed.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Default key namespace prefix.
pub const DEFAULT_PREFIX: &str = "floodgate";

/// Errors produced by a concrete backend. These never escape the
/// [`CounterStore`] facade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached (timeout, refused connection, I/O).
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// The backend answered, but not in a way we could use.
    #[error("backing store protocol error: {0}")]
    Protocol(String),
}

/// Abstract counter storage.
///
/// Values are strings; counters are decimal integers incremented atomically
/// by the backend. `incr` must apply `ttl` on the first increment of a fresh
/// key so counters expire even if no explicit expiry call ever runs.
#[async_trait]
pub trait CounterBackend: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns `true` if the key was absent and has been set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Atomic increment; returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn clear_prefix(&self, prefix: &str) -> Result<(), StoreError>;
}

/// Fail-open counter store: primary backend with in-process fallback.
///
/// Cheap to clone; clones share both the primary connection and the fallback
/// map. Keys are namespaced `{prefix}:{logical-key}`; [`CounterStore::scoped`]
/// overrides the prefix per call site.
#[derive(Clone, Debug)]
pub struct CounterStore {
    primary: Option<Arc<dyn CounterBackend>>,
    local: MemoryBackend,
    prefix: Arc<str>,
}

impl CounterStore {
    /// Purely in-process store. Used directly in tests and as the degraded
    /// mode of every other configuration.
    pub fn in_process() -> Self {
        Self {
            primary: None,
            local: MemoryBackend::new(),
            prefix: Arc::from(DEFAULT_PREFIX),
        }
    }

    /// Store backed by `primary`, with the in-process map as fallback.
    pub fn with_backend(primary: Arc<dyn CounterBackend>) -> Self {
        Self {
            primary: Some(primary),
            local: MemoryBackend::new(),
            prefix: Arc::from(DEFAULT_PREFIX),
        }
    }

    /// Connect to a Redis-compatible service; the in-process map remains the
    /// fallback for the lifetime of the store.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::with_backend(Arc::new(RedisBackend::connect(url)?)))
    }

    /// A view of the same store under a different key prefix.
    pub fn scoped(&self, prefix: impl Into<String>) -> Self {
        Self {
            primary: self.primary.clone(),
            local: self.local.clone(),
            prefix: Arc::from(prefix.into()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let key = self.namespaced(key);
        if let Some(primary) = &self.primary {
            match primary.get(&key).await {
                Ok(v) => return v,
                Err(e) => tracing::warn!(key = %key, error = %e, "counter store get failed, using local fallback"),
            }
        }
        self.local.get_sync(&key)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let key = self.namespaced(key);
        if let Some(primary) = &self.primary {
            match primary.set(&key, value, ttl).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(key = %key, error = %e, "counter store set failed, using local fallback"),
            }
        }
        self.local.set_sync(&key, value, ttl);
    }

    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let key = self.namespaced(key);
        if let Some(primary) = &self.primary {
            match primary.set_if_absent(&key, value, ttl).await {
                Ok(set) => return set,
                Err(e) => tracing::warn!(key = %key, error = %e, "counter store setnx failed, using local fallback"),
            }
        }
        self.local.set_if_absent_sync(&key, value, ttl)
    }

    /// Atomic increment with TTL applied on the first hit of a fresh key.
    pub async fn incr(&self, key: &str, ttl: Duration) -> i64 {
        let key = self.namespaced(key);
        if let Some(primary) = &self.primary {
            match primary.incr(&key, ttl).await {
                Ok(v) => return v,
                Err(e) => tracing::warn!(key = %key, error = %e, "counter store incr failed, counting locally"),
            }
        }
        self.local.incr_sync(&key, ttl)
    }

    pub async fn mget(&self, keys: &[&str]) -> Vec<Option<String>> {
        let namespaced: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        if let Some(primary) = &self.primary {
            match primary.mget(&namespaced).await {
                Ok(values) => return values,
                Err(e) => tracing::warn!(error = %e, "counter store mget failed, using local fallback"),
            }
        }
        namespaced.iter().map(|k| self.local.get_sync(k)).collect()
    }

    /// Delete from the primary and the fallback; the fallback may hold state
    /// accrued during an earlier outage.
    pub async fn delete(&self, key: &str) {
        let key = self.namespaced(key);
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.del(&key).await {
                tracing::warn!(key = %key, error = %e, "counter store delete failed on primary");
            }
        }
        self.local.del_sync(&key);
    }

    /// Clear every key under `{store prefix}:{prefix}` in both backends.
    pub async fn clear_prefix(&self, prefix: &str) {
        let prefix = self.namespaced(prefix);
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.clear_prefix(&prefix).await {
                tracing::warn!(prefix = %prefix, error = %e, "counter store clear failed on primary");
            }
        }
        self.local.clear_prefix_sync(&prefix);
    }
}
