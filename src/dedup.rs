//! Request deduplication: collapse concurrent identical requests into one
//! in-flight execution.
//!
//! The first caller for a fresh key installs a shared future; every
//! concurrent caller for the same key awaits that same execution and
//! receives the same result or error. The entry is removed when the
//! operation settles, and additionally after a TTL as a safety net against a
//! handle that never settles — a key is never stuck in flight forever.

use crate::error::AdmissionError;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default safety-net TTL for an entry that never settles.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5);

type SharedOp<T, E> = Shared<BoxFuture<'static, Result<T, Arc<E>>>>;

struct Entry<T, E> {
    /// Guards removal: a settled or expired entry must not clobber a fresh
    /// entry installed later under the same key.
    id: u64,
    fut: SharedOp<T, E>,
}

/// Collapses concurrent identical operations onto one execution.
pub struct RequestDeduplicator<T, E> {
    entries: Arc<Mutex<HashMap<String, Entry<T, E>>>>,
    ttl: Duration,
    ids: AtomicU64,
}

impl<T, E> Default for RequestDeduplicator<T, E> {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

impl<T, E> RequestDeduplicator<T, E> {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), ttl, ids: AtomicU64::new(0) }
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Run `op` once per key, sharing the outcome with every concurrent
    /// caller, using the deduplicator's default TTL.
    pub async fn deduplicate<F, Fut>(&self, key: &str, op: F) -> Result<T, AdmissionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.deduplicate_with_ttl(key, op, self.ttl).await
    }

    /// As [`deduplicate`](Self::deduplicate) with an explicit safety-net TTL.
    pub async fn deduplicate_with_ttl<F, Fut>(
        &self,
        key: &str,
        op: F,
        ttl: Duration,
    ) -> Result<T, AdmissionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (fut, id) = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some(entry) => (entry.fut.clone(), entry.id),
                None => {
                    let id = self.ids.fetch_add(1, Ordering::SeqCst);
                    // Constructing the future here does not run it; work
                    // progresses only while callers poll the shared handle.
                    let fut: SharedOp<T, E> =
                        op().map(|r: Result<T, E>| r.map_err(Arc::new)).boxed().shared();
                    entries.insert(key.to_string(), Entry { id, fut: fut.clone() });

                    let entries = self.entries.clone();
                    let key = key.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(ttl).await;
                        let mut entries = entries.lock().unwrap();
                        if entries.get(&key).map(|e| e.id) == Some(id) {
                            tracing::warn!(key = %key, "dedup entry expired before settling");
                            entries.remove(&key);
                        }
                    });
                    (fut, id)
                }
            }
        };

        let result = fut.await;

        // First finisher removes the entry; the id check keeps a successor
        // entry for the same key intact.
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.get(key).map(|e| e.id) == Some(id) {
                entries.remove(key);
            }
        }

        result.map_err(|source| AdmissionError::DedupFailed { source })
    }
}

impl<T, E> std::fmt::Debug for RequestDeduplicator<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("in_flight", &self.in_flight())
            .field("ttl", &self.ttl)
            .finish()
    }
}
