#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Distributed admission control for async Rust: decide, under concurrent
//! load and partial infrastructure failure, whether a unit of work may
//! proceed right now, and bound how much work is in flight against scarce
//! downstream resources.
//!
//! ## Components
//!
//! - **Counter store** ([`store`]): shared counters on any Redis-compatible
//!   service, with a transparent per-process fallback. Fails open: a store
//!   outage relaxes limits from global to per-process, never rejects traffic.
//! - **Rate limit engine** ([`engine`]): fixed-window, sliding-window, and
//!   token-bucket rules with burst sub-limits and priority resolution.
//! - **Adaptive tiering** ([`tiering`]): per-caller limit multipliers and
//!   global load shedding with hysteresis.
//! - **Connection pool** ([`pool`]): bounded concurrency with FIFO queueing
//!   and a wait timeout.
//! - **Request batcher** ([`batcher`]): coalesce near-simultaneous requests
//!   into one downstream call.
//! - **Request deduplicator** ([`dedup`]): collapse concurrent identical
//!   requests onto one execution.
//! - **Monitoring facade** ([`monitor`]): rolling statistics and threshold
//!   alerts; strictly read-only.
//! - **Tower middleware** ([`middleware`]): admission checks in front of any
//!   `tower` service, plus the `RateLimit-*` wire surface.
//!
//! ## Quick start
//!
//! ```rust
//! use floodgate::{AdmissionKey, CounterStore, RateLimitEngine, presets};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = RateLimitEngine::new(CounterStore::in_process(), presets::default_rules());
//!
//!     let key = AdmissionKey::compose("/api/auth/login", "203.0.113.7");
//!     let verdict = engine.check(&key, "/api/auth/login").await;
//!     assert!(verdict.allowed);
//! }
//! ```
//!
//! Point the store at Redis (`CounterStore::connect("redis://…")`) and the
//! same checks become cluster-wide.

pub mod adaptive;
pub mod batcher;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod monitor;
pub mod pool;
pub mod presets;
pub mod rules;
pub mod store;
pub mod tiering;

// Re-exports
pub use adaptive::DynamicConfig;
pub use batcher::RequestBatcher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AdmissionConfig;
pub use dedup::RequestDeduplicator;
pub use engine::{AdmissionCheck, RateLimitEngine, Reason, Verdict};
pub use error::{AdmissionError, PoolTimeoutError};
pub use middleware::{AdmissionLayer, AdmissionRequest, AdmissionService};
pub use monitor::{Alert, PerformanceMonitor, RealTimeMetrics};
pub use pool::{ConnectionPool, PoolStats, PoolToken};
pub use rules::{
    AdmissionKey, BurstConfig, FixedWindowRule, Rule, RuleSet, SlidingWindowRule, TokenBucketRule,
};
pub use store::{CounterBackend, CounterStore, MemoryBackend, RedisBackend, StoreError};
pub use tiering::{LoadShedder, StaticTier, Tier, TierMultipliers, TierResolver, TieredEngine};
