//! Error types for admission control.
//!
//! Infrastructure faults (an unreachable counter store) are absorbed at the
//! store layer and never appear here. What does surface: structured rate-limit
//! denials, pool acquisition timeouts, batch/dedup failures shared by every
//! waiter, and the wrapped operation's own error.

use crate::engine::Verdict;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A queued pool acquisition waited past the configured timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTimeoutError {
    /// How long the caller waited in the queue.
    pub waited: Duration,
    /// The pool's concurrency bound.
    pub max_connections: usize,
}

impl fmt::Display for PoolTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection pool timeout after {:?} ({} connections max)",
            self.waited, self.max_connections
        )
    }
}

impl std::error::Error for PoolTimeoutError {}

/// Unified error type for admission-controlled operations.
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The rate limiter denied the request; carries the full verdict.
    Denied(Verdict),
    /// A queued pool acquisition timed out.
    PoolTimeout(PoolTimeoutError),
    /// The batch processor failed; every waiter in the batch sees this error.
    BatchFailed { source: Arc<E> },
    /// The batch flushed without producing a result for this caller.
    BatchDropped,
    /// The deduplicated operation failed; every waiter on the key sees this error.
    DedupFailed { source: Arc<E> },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(verdict) => {
                write!(
                    f,
                    "rate limit exceeded ({}; {} of {} remaining, resets at {})",
                    verdict.reason.as_str(),
                    verdict.remaining,
                    verdict.limit,
                    verdict.reset_at
                )
            }
            Self::PoolTimeout(e) => write!(f, "{}", e),
            Self::BatchFailed { source } => write!(f, "batch processing failed: {}", source),
            Self::BatchDropped => write!(f, "batch flushed without a result for this request"),
            Self::DedupFailed { source } => write!(f, "deduplicated operation failed: {}", source),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::BatchFailed { source } | Self::DedupFailed { source } => {
                Some(source.as_ref() as &dyn std::error::Error)
            }
            Self::PoolTimeout(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<PoolTimeoutError> for AdmissionError<E> {
    fn from(e: PoolTimeoutError) -> Self {
        Self::PoolTimeout(e)
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error is a rate-limit denial.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// Check if this error is a pool acquisition timeout.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, Self::PoolTimeout(_))
    }

    /// Check if this error came from a batch flush.
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::BatchFailed { .. } | Self::BatchDropped)
    }

    /// Check if this error came from a deduplicated operation.
    pub fn is_dedup(&self) -> bool {
        matches!(self, Self::DedupFailed { .. })
    }

    /// Check if this error wraps the operation's own error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Borrow the denial verdict if present.
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            Self::Denied(v) => Some(v),
            _ => None,
        }
    }

    /// Get the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the failure shared across batch/dedup waiters, if present.
    pub fn shared_source(&self) -> Option<&E> {
        match self {
            Self::BatchFailed { source } | Self::DedupFailed { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Reason, Verdict};
    use std::fmt;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    fn denied_verdict() -> Verdict {
        Verdict {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: 1_700_000_060,
            total_hits: 6,
            reason: Reason::RateLimitExceeded,
        }
    }

    #[test]
    fn denied_display_includes_reason_and_reset() {
        let err: AdmissionError<io::Error> = AdmissionError::Denied(denied_verdict());
        let msg = format!("{}", err);
        assert!(msg.contains("RATE_LIMIT_EXCEEDED"));
        assert!(msg.contains("1700000060"));
    }

    #[test]
    fn pool_timeout_display() {
        let err: AdmissionError<io::Error> = AdmissionError::PoolTimeout(PoolTimeoutError {
            waited: Duration::from_secs(30),
            max_connections: 10,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("pool timeout"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn batch_failure_shares_one_source() {
        let source = Arc::new(DummyError("upstream exploded"));
        let a: AdmissionError<DummyError> = AdmissionError::BatchFailed { source: source.clone() };
        let b: AdmissionError<DummyError> = AdmissionError::BatchFailed { source };
        assert_eq!(a.shared_source(), b.shared_source());
        assert!(a.is_batch());
        assert!(format!("{}", a).contains("upstream exploded"));
    }

    #[test]
    fn predicates_cover_all_variants() {
        let denied: AdmissionError<DummyError> = AdmissionError::Denied(denied_verdict());
        assert!(denied.is_denied());
        assert!(denied.verdict().is_some());
        assert!(!denied.is_inner());

        let timeout: AdmissionError<DummyError> = PoolTimeoutError {
            waited: Duration::from_secs(1),
            max_connections: 2,
        }
        .into();
        assert!(timeout.is_pool_timeout());

        let dedup: AdmissionError<DummyError> =
            AdmissionError::DedupFailed { source: Arc::new(DummyError("x")) };
        assert!(dedup.is_dedup());

        let dropped: AdmissionError<DummyError> = AdmissionError::BatchDropped;
        assert!(dropped.is_batch());
        assert!(dropped.shared_source().is_none());
    }

    #[test]
    fn into_inner_extracts_error() {
        let err = AdmissionError::Inner(DummyError("boom"));
        assert!(err.is_inner());
        assert_eq!(err.into_inner(), Some(DummyError("boom")));
    }

    #[test]
    fn source_chains_to_shared_failure() {
        use std::error::Error;
        let err: AdmissionError<DummyError> =
            AdmissionError::DedupFailed { source: Arc::new(DummyError("root")) };
        assert_eq!(err.source().map(|e| e.to_string()), Some("root".to_string()));

        let denied: AdmissionError<DummyError> = AdmissionError::Denied(denied_verdict());
        assert!(denied.source().is_none());
    }
}
