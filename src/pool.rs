//! Bounded connection pool for downstream calls.
//!
//! Caps concurrent in-flight work against a scarce resource (an AI endpoint,
//! the primary datastore). When all slots are held, further acquisitions
//! queue FIFO instead of failing; a queued acquisition that outlives the
//! configured timeout rejects with [`PoolTimeoutError`] and can never consume
//! a slot afterwards. Releasing a slot hands it atomically to the oldest
//! waiter before any newcomer can steal it — both properties come from
//! tokio's fair semaphore.

use crate::error::{AdmissionError, PoolTimeoutError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default bound on how long an acquisition may wait in the queue.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// One unit of granted downstream concurrency.
///
/// Returned by [`ConnectionPool::acquire`]; the slot frees on
/// [`ConnectionPool::release`] or when the token is dropped. A token that is
/// held forever leaks capacity — the queue timeout bounds waiters, not
/// holders.
#[derive(Debug)]
pub struct PoolToken {
    _permit: OwnedSemaphorePermit,
}

/// Read-only pool counters for observability.
///
/// Never use these to gate admission; by the time a decision is made on them
/// the numbers are stale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    pub active: usize,
    pub queued: usize,
    pub max: usize,
    /// Percent of slots held, 0–100.
    pub utilization: f64,
}

#[derive(Clone)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    max: usize,
    acquire_timeout: Duration,
    queued: Arc<AtomicUsize>,
}

/// Decrements the queued count even when the waiting future is cancelled.
struct QueueGuard<'a>(&'a AtomicUsize);

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionPool {
    pub fn new(max: usize) -> Self {
        Self::with_timeout(max, DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn with_timeout(max: usize, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            acquire_timeout,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire one slot, queueing FIFO when the pool is saturated.
    pub async fn acquire(&self) -> Result<PoolToken, PoolTimeoutError> {
        // Fast path: a free slot, no queueing.
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(PoolToken { _permit: permit });
        }

        let start = Instant::now();
        self.queued.fetch_add(1, Ordering::SeqCst);
        let _guard = QueueGuard(self.queued.as_ref());

        match tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => Ok(PoolToken { _permit: permit }),
            // The semaphore is never closed; a timed-out waiter has already
            // left the queue and cannot claim a permit later.
            Ok(Err(_)) | Err(_) => Err(PoolTimeoutError {
                waited: start.elapsed(),
                max_connections: self.max,
            }),
        }
    }

    /// Return a slot to the pool. Dropping the token has the same effect;
    /// this spelling keeps the release site explicit.
    pub fn release(&self, token: PoolToken) {
        drop(token);
    }

    /// Run `operation` inside one pool slot.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, AdmissionError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let token = self.acquire().await?;
        let result = operation().await;
        self.release(token);
        result.map_err(AdmissionError::Inner)
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.max.saturating_sub(self.semaphore.available_permits());
        PoolStats {
            active,
            queued: self.queued.load(Ordering::SeqCst),
            max: self.max,
            utilization: if self.max == 0 { 0.0 } else { (active as f64 / self.max as f64) * 100.0 },
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("active", &stats.active)
            .field("queued", &stats.queued)
            .field("max", &stats.max)
            .finish()
    }
}
