//! In-process counter backend.
//!
//! This map is the degraded mode of every [`CounterStore`](super::CounterStore):
//! never synchronized across processes, cleared on restart. Mutations go
//! through a single mutex, which is all the atomicity the fallback path needs.

use super::{CounterBackend, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Evict expired entries after this many mutations so cold keys cannot
/// accumulate between accesses.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    mutations: u64,
}

impl Inner {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.expires_at > now)
    }

    fn bump(&mut self, now: Instant) {
        self.mutations += 1;
        if self.mutations % SWEEP_INTERVAL == 0 {
            self.entries.retain(|_, e| e.expires_at > now);
        }
    }
}

/// Per-process counter map with TTL semantics.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, mostly for tests and stats.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner.entries.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get_sync(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.live(key, now).is_none() {
            inner.entries.remove(key);
            return None;
        }
        inner.live(key, now).map(|e| e.value.clone())
    }

    pub(crate) fn set_sync(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.bump(now);
        inner
            .entries
            .insert(key.to_string(), Entry { value: value.to_string(), expires_at: now + ttl });
    }

    pub(crate) fn set_if_absent_sync(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.bump(now);
        if inner.live(key, now).is_some() {
            return false;
        }
        inner
            .entries
            .insert(key.to_string(), Entry { value: value.to_string(), expires_at: now + ttl });
        true
    }

    pub(crate) fn incr_sync(&self, key: &str, ttl: Duration) -> i64 {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.bump(now);
        let live = inner.live(key, now).map(|e| (e.value.parse::<i64>().unwrap_or(0), e.expires_at));
        match live {
            Some((current, expires_at)) => {
                // Keep the expiry from the first hit; counters expire with
                // their window, not with their latest increment.
                let next = current + 1;
                inner
                    .entries
                    .insert(key.to_string(), Entry { value: next.to_string(), expires_at });
                next
            }
            None => {
                inner
                    .entries
                    .insert(key.to_string(), Entry { value: "1".to_string(), expires_at: now + ttl });
                1
            }
        }
    }

    pub(crate) fn del_sync(&self, key: &str) {
        self.inner.lock().unwrap().entries.remove(key);
    }

    pub(crate) fn clear_prefix_sync(&self, prefix: &str) {
        self.inner.lock().unwrap().entries.retain(|k, _| !k.starts_with(prefix));
    }
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_sync(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.set_sync(key, value, ttl);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.set_if_absent_sync(key, value, ttl))
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        Ok(self.incr_sync(key, ttl))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        Ok(keys.iter().map(|k| self.get_sync(k)).collect())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.del_sync(key);
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        self.clear_prefix_sync(prefix);
        Ok(())
    }
}
