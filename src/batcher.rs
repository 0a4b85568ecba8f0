//! Request batching: coalesce near-simultaneous logical requests sharing a
//! batch key into one downstream call.
//!
//! A batch flushes when it reaches the size threshold or when its flush timer
//! fires; the timer is re-armed on each arrival, which the size threshold
//! bounds. The processor runs once per flush and its per-item results fan
//! back to the waiters by position. Batching trades latency for downstream
//! call reduction and never silently drops a caller: a missing result or a
//! processor failure is delivered to the affected waiters as an error.

use crate::error::AdmissionError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default size threshold before an immediate flush.
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Default flush timer for a batch that never fills.
pub const DEFAULT_FLUSH_AFTER: Duration = Duration::from_secs(1);

type Processor<P, T, E> = Arc<dyn Fn(Vec<P>) -> BoxFuture<'static, Result<Vec<T>, E>> + Send + Sync>;

struct Waiter<P, T, E> {
    params: P,
    tx: oneshot::Sender<Result<T, AdmissionError<E>>>,
}

/// Short-lived mutable group of pending requests; destroyed at flush,
/// never reused.
struct Batch<P, T, E> {
    waiters: Vec<Waiter<P, T, E>>,
    processor: Processor<P, T, E>,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner<P, T, E> {
    max_size: usize,
    flush_after: Duration,
    batches: Mutex<HashMap<String, Batch<P, T, E>>>,
    epochs: AtomicU64,
}

/// Coalesces requests sharing a batch key into one processor call.
pub struct RequestBatcher<P, T, E> {
    inner: Arc<Inner<P, T, E>>,
}

impl<P, T, E> Clone for RequestBatcher<P, T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P, T, E> Default for RequestBatcher<P, T, E>
where
    P: Send + 'static,
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_AFTER)
    }
}

impl<P, T, E> RequestBatcher<P, T, E>
where
    P: Send + 'static,
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(max_size: usize, flush_after: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_size: max_size.max(1),
                flush_after,
                batches: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Total waiters currently parked across all pending batches.
    pub fn pending(&self) -> usize {
        self.inner.batches.lock().unwrap().values().map(|b| b.waiters.len()).sum()
    }

    /// Join the batch for `batch_key` and wait for its flush.
    ///
    /// The processor of the most recent arrival is the one a flush runs, so
    /// callers sharing a key should pass equivalent processors.
    pub async fn add_request<F, Fut>(
        &self,
        batch_key: &str,
        params: P,
        processor: F,
    ) -> Result<T, AdmissionError<E>>
    where
        F: Fn(Vec<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let processor: Processor<P, T, E> = Arc::new(move |batch| Box::pin(processor(batch)));

        let full = {
            let mut batches = self.inner.batches.lock().unwrap();
            let batch = batches.entry(batch_key.to_string()).or_insert_with(|| Batch {
                waiters: Vec::new(),
                processor: processor.clone(),
                epoch: self.inner.epochs.fetch_add(1, Ordering::SeqCst),
                timer: None,
            });
            batch.processor = processor;
            batch.waiters.push(Waiter { params, tx });

            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }

            if batch.waiters.len() >= self.inner.max_size {
                batches.remove(batch_key)
            } else {
                let inner = self.inner.clone();
                let key = batch_key.to_string();
                let epoch = batch.epoch;
                let flush_after = self.inner.flush_after;
                batch.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(flush_after).await;
                    Inner::flush_epoch(&inner, &key, epoch).await;
                }));
                None
            }
        };

        if let Some(batch) = full {
            // The arrival that filled the batch drives the flush.
            Inner::flush(batch).await;
        }

        rx.await.unwrap_or(Err(AdmissionError::BatchDropped))
    }
}

impl<P, T, E> Inner<P, T, E>
where
    P: Send + 'static,
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Timer-driven flush; a no-op if the batch already flushed on size (the
    /// epoch guards against flushing a successor batch under the same key).
    async fn flush_epoch(inner: &Arc<Self>, key: &str, epoch: u64) {
        let batch = {
            let mut batches = inner.batches.lock().unwrap();
            match batches.get(key) {
                Some(b) if b.epoch == epoch => batches.remove(key),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            Self::flush(batch).await;
        }
    }

    async fn flush(batch: Batch<P, T, E>) {
        // Dropping the timer handle detaches it; the timer path reaches here
        // from inside that very task, so it must not abort itself.
        let Batch { waiters, processor, .. } = batch;
        let (txs, params): (Vec<_>, Vec<_>) =
            waiters.into_iter().map(|w| (w.tx, w.params)).unzip();
        let expected = txs.len();

        match processor(params).await {
            Ok(results) => {
                let produced = results.len();
                if produced < expected {
                    tracing::warn!(
                        expected,
                        produced,
                        "batch processor returned fewer results than requests"
                    );
                }
                let mut results = results.into_iter();
                for tx in txs {
                    let outcome = match results.next() {
                        Some(value) => Ok(value),
                        None => Err(AdmissionError::BatchDropped),
                    };
                    // A cancelled caller has dropped its receiver; skip it.
                    let _ = tx.send(outcome);
                }
            }
            Err(e) => {
                let shared = Arc::new(e);
                for tx in txs {
                    let _ = tx.send(Err(AdmissionError::BatchFailed { source: shared.clone() }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn full_batch_invokes_processor_once_and_fans_out_by_position() {
        let batcher: RequestBatcher<u32, u32, TestError> =
            RequestBatcher::new(5, Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5u32)
            .map(|i| {
                let batcher = batcher.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    batcher
                        .add_request("embed", i, move |batch: Vec<u32>| {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                Ok(batch.into_iter().map(|p| p * 2).collect())
                            }
                        })
                        .await
                })
            })
            .collect();

        let results = join_all(tasks).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap().unwrap(), (i as u32) * 2);
        }
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn partial_batch_flushes_on_timer() {
        let batcher: RequestBatcher<u32, u32, TestError> =
            RequestBatcher::new(10, Duration::from_millis(50));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..2u32)
            .map(|i| {
                let batcher = batcher.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    batcher
                        .add_request("partial", i, move |batch: Vec<u32>| {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                Ok(batch.into_iter().map(|p| p + 100).collect())
                            }
                        })
                        .await
                })
            })
            .collect();

        let results = join_all(tasks).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap().unwrap(), i as u32 + 100);
        }
    }

    #[tokio::test]
    async fn processor_failure_reaches_every_waiter() {
        let batcher: RequestBatcher<u32, u32, TestError> =
            RequestBatcher::new(3, Duration::from_secs(10));

        let tasks: Vec<_> = (0..3u32)
            .map(|i| {
                let batcher = batcher.clone();
                tokio::spawn(async move {
                    batcher
                        .add_request("doomed", i, |_batch: Vec<u32>| async {
                            Err(TestError("model endpoint 500"))
                        })
                        .await
                })
            })
            .collect();

        for result in join_all(tasks).await {
            let err = result.unwrap().unwrap_err();
            assert!(err.is_batch());
            assert_eq!(err.shared_source(), Some(&TestError("model endpoint 500")));
        }
    }

    #[tokio::test]
    async fn short_result_set_drops_only_the_tail() {
        let batcher: RequestBatcher<u32, u32, TestError> =
            RequestBatcher::new(3, Duration::from_secs(10));

        let tasks: Vec<_> = (0..3u32)
            .map(|i| {
                let batcher = batcher.clone();
                tokio::spawn(async move {
                    batcher
                        .add_request("short", i, |batch: Vec<u32>| async move {
                            // One result goes missing.
                            Ok(batch.into_iter().take(2).collect())
                        })
                        .await
                })
            })
            .collect();

        let results = join_all(tasks).await;
        let ok = results
            .iter()
            .filter(|r| r.as_ref().unwrap().is_ok())
            .count();
        assert_eq!(ok, 2);
        let dropped = results
            .iter()
            .filter(|r| {
                matches!(r.as_ref().unwrap(), Err(AdmissionError::BatchDropped))
            })
            .count();
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn distinct_keys_batch_independently() {
        let batcher: RequestBatcher<u32, u32, TestError> =
            RequestBatcher::new(2, Duration::from_millis(50));
        let calls = Arc::new(AtomicUsize::new(0));

        let spawn = |key: &'static str, value: u32| {
            let batcher = batcher.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                batcher
                    .add_request(key, value, move |batch: Vec<u32>| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(batch)
                        }
                    })
                    .await
            })
        };

        let a1 = spawn("a", 1);
        let a2 = spawn("a", 2);
        let b1 = spawn("b", 3);

        assert_eq!(a1.await.unwrap().unwrap(), 1);
        assert_eq!(a2.await.unwrap().unwrap(), 2);
        assert_eq!(b1.await.unwrap().unwrap(), 3);
        // "a" flushed on size, "b" on its timer.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
