//! Rate limit engine: evaluates registered rules against the counter store
//! and produces a [`Verdict`].
//!
//! Every matching rule is evaluated and counted on every check, so a
//! low-priority global rule still accrues usage when a high-priority rule
//! decides the outcome. Burst sub-rules are checked first and take precedence
//! over any declared priority. The engine never errors: infrastructure faults
//! are absorbed by the [`CounterStore`](crate::store::CounterStore) and
//! corrupt window state is treated as fresh, so the admission layer can never
//! be the reason user traffic fails.

use crate::clock::{Clock, SystemClock};
use crate::rules::{AdmissionKey, BurstConfig, FixedWindowRule, Rule, RuleSet, TokenBucketRule};
use crate::store::CounterStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Allowed,
    RateLimitExceeded,
    BurstLimitExceeded,
}

impl Reason {
    /// Wire code for response bodies and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Allowed => "ALLOWED",
            Reason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Reason::BurstLimitExceeded => "BURST_LIMIT_EXCEEDED",
        }
    }
}

/// The outcome of one admission check. Immutable; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// Effective limit of the reported rule (after tier/load scaling).
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the reported window resets.
    pub reset_at: u64,
    pub total_hits: u32,
    pub reason: Reason,
}

impl Verdict {
    fn unlimited(now_secs: u64) -> Self {
        Self {
            allowed: true,
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_at: now_secs,
            total_hits: 0,
            reason: Reason::Allowed,
        }
    }

    /// Seconds until the reported window resets, for `Retry-After`.
    pub fn retry_after(&self, now_secs: u64) -> u64 {
        self.reset_at.saturating_sub(now_secs)
    }
}

/// Anything that can render an admission verdict for a key + endpoint.
///
/// Implemented by [`RateLimitEngine`] and
/// [`TieredEngine`](crate::tiering::TieredEngine) so callers and middleware
/// can take either.
#[async_trait]
pub trait AdmissionCheck: Send + Sync {
    async fn check(&self, key: &AdmissionKey, endpoint: &str) -> Verdict;
}

/// Evaluation result for a single rule.
struct RuleOutcome {
    allowed: bool,
    limit: u32,
    remaining: u32,
    reset_at: u64,
    hits: u32,
}

/// Persisted token-bucket state.
#[derive(Debug, Serialize, Deserialize)]
struct TokenState {
    tokens: f64,
    refreshed_ms: u64,
}

/// Apply a request-scoped scaling factor to a rule limit.
///
/// Clamped to at least 1 so aggressive load shedding degrades to "one at a
/// time" instead of rejecting everything.
fn scale_limit(limit: u32, factor: f64) -> u32 {
    ((limit as f64) * factor).floor().max(1.0) as u32
}

/// The rate limit engine.
pub struct RateLimitEngine {
    store: CounterStore,
    rules: RuleSet,
    clock: Arc<dyn Clock>,
}

impl RateLimitEngine {
    pub fn new(store: CounterStore, rules: RuleSet) -> Self {
        Self::with_clock(store, rules, Arc::new(SystemClock))
    }

    pub fn with_clock(store: CounterStore, rules: RuleSet, clock: Arc<dyn Clock>) -> Self {
        Self { store, rules, clock }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check `key` against every rule matching `endpoint`.
    pub async fn check(&self, key: &AdmissionKey, endpoint: &str) -> Verdict {
        self.check_scaled(key, endpoint, 1.0).await
    }

    /// Check with a request-scoped limit factor (tier multiplier × load
    /// shed). Shared rule state is never mutated, so concurrent checks under
    /// different factors cannot contaminate each other.
    pub async fn check_scaled(&self, key: &AdmissionKey, endpoint: &str, factor: f64) -> Verdict {
        let now_ms = self.clock.now_millis();
        let matching = self.rules.matching(endpoint);
        if matching.is_empty() {
            return Verdict::unlimited(now_ms / 1000);
        }

        let mut burst_denial: Option<RuleOutcome> = None;
        let mut outcomes: Vec<RuleOutcome> = Vec::with_capacity(matching.len());

        for rule in &matching {
            if let Some(burst) = rule.burst() {
                let outcome = self.eval_burst(rule.name(), key, burst, now_ms).await;
                if !outcome.allowed && burst_denial.is_none() {
                    burst_denial = Some(outcome);
                }
            }

            let eff_limit = scale_limit(rule.limit(), factor);
            let outcome = match rule {
                Rule::FixedWindow(r) => self.eval_fixed(r, key, eff_limit, now_ms).await,
                Rule::SlidingWindow(r) => {
                    let state_key = format!("sw:{}:{}", r.name, key);
                    self.eval_sliding(&state_key, eff_limit, r.window, now_ms).await
                }
                Rule::TokenBucket(r) => self.eval_token(r, key, eff_limit, now_ms).await,
            };
            outcomes.push(outcome);
        }

        // Burst rules exist to catch short-interval hammering; a burst denial
        // overrides any primary verdict regardless of priority.
        if let Some(burst) = burst_denial {
            return Verdict {
                allowed: false,
                limit: burst.limit,
                remaining: 0,
                reset_at: burst.reset_at,
                total_hits: burst.hits,
                reason: Reason::BurstLimitExceeded,
            };
        }

        // The highest-priority rule governs; matching() yields it first.
        if let Some(governing) = outcomes.first() {
            if !governing.allowed {
                return Verdict {
                    allowed: false,
                    limit: governing.limit,
                    remaining: 0,
                    reset_at: governing.reset_at,
                    total_hits: governing.hits,
                    reason: Reason::RateLimitExceeded,
                };
            }
        }

        // Report the tightest rule's quota.
        let tightest = outcomes.iter().min_by_key(|o| o.remaining);
        match tightest {
            Some(o) => Verdict {
                allowed: true,
                limit: o.limit,
                remaining: o.remaining,
                reset_at: o.reset_at,
                total_hits: o.hits,
                reason: Reason::Allowed,
            },
            None => Verdict::unlimited(now_ms / 1000),
        }
    }

    /// Fixed window: one counter per window slot, incremented on every check.
    /// Cheap, atomic on the backend, and admits up to `2 × limit` across a
    /// window boundary.
    async fn eval_fixed(
        &self,
        rule: &FixedWindowRule,
        key: &AdmissionKey,
        eff_limit: u32,
        now_ms: u64,
    ) -> RuleOutcome {
        let window_ms = rule.window.as_millis().max(1) as u64;
        let slot = now_ms / window_ms;
        let counter_key = format!("fw:{}:{}:{}", rule.name, key, slot);
        let count = self
            .store
            .incr(&counter_key, rule.window + Duration::from_secs(1))
            .await
            .max(0) as u64;

        RuleOutcome {
            allowed: count <= eff_limit as u64,
            limit: eff_limit,
            remaining: (eff_limit as u64).saturating_sub(count).min(u32::MAX as u64) as u32,
            reset_at: ((slot + 1) * window_ms).div_ceil(1000),
            hits: count.min(u32::MAX as u64) as u32,
        }
    }

    /// Sliding window: evict timestamps older than the lookback, admit iff
    /// fewer than `limit` remain, and only then record the new event. Reset
    /// time on denial is when the oldest recorded event leaves the window.
    async fn eval_sliding(
        &self,
        state_key: &str,
        eff_limit: u32,
        window: Duration,
        now_ms: u64,
    ) -> RuleOutcome {
        let window_ms = window.as_millis().max(1) as u64;
        let floor = now_ms.saturating_sub(window_ms);

        // Corrupt state reads as an empty window: fail open, never fail the check.
        let mut stamps: Vec<u64> = self
            .store
            .get(state_key)
            .await
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        stamps.retain(|&t| t > floor);

        let allowed = (stamps.len() as u64) < eff_limit as u64;
        if allowed {
            stamps.push(now_ms);
        }
        let hits = stamps.len().min(u32::MAX as usize) as u32;

        if let Ok(body) = serde_json::to_string(&stamps) {
            self.store
                .set(state_key, &body, window + Duration::from_secs(1))
                .await;
        }

        let reset_ms = if allowed {
            now_ms + window_ms
        } else {
            stamps.first().copied().unwrap_or(now_ms) + window_ms
        };

        RuleOutcome {
            allowed,
            limit: eff_limit,
            remaining: eff_limit.saturating_sub(hits),
            reset_at: reset_ms.div_ceil(1000),
            hits,
        }
    }

    /// Token bucket: balance replenished continuously at `limit / window`,
    /// one token consumed per admitted call, state persisted only on consume.
    async fn eval_token(
        &self,
        rule: &TokenBucketRule,
        key: &AdmissionKey,
        eff_limit: u32,
        now_ms: u64,
    ) -> RuleOutcome {
        let window_ms = rule.window.as_millis().max(1) as u64 as f64;
        let state_key = format!("tb:{}:{}", rule.name, key);

        let state = self
            .store
            .get(&state_key)
            .await
            .and_then(|raw| serde_json::from_str::<TokenState>(&raw).ok())
            .unwrap_or(TokenState { tokens: eff_limit as f64, refreshed_ms: now_ms });

        let elapsed_ms = now_ms.saturating_sub(state.refreshed_ms) as f64;
        let refill = elapsed_ms * eff_limit as f64 / window_ms;
        let tokens = (state.tokens + refill).min(eff_limit as f64);

        if tokens >= 1.0 {
            let balance = tokens - 1.0;
            let next = TokenState { tokens: balance, refreshed_ms: now_ms };
            if let Ok(body) = serde_json::to_string(&next) {
                self.store
                    .set(&state_key, &body, rule.window + Duration::from_secs(1))
                    .await;
            }
            let remaining = balance.floor().max(0.0) as u32;
            RuleOutcome {
                allowed: true,
                limit: eff_limit,
                remaining,
                reset_at: (now_ms + window_ms as u64).div_ceil(1000),
                hits: eff_limit.saturating_sub(remaining),
            }
        } else {
            let per_token_ms = window_ms / eff_limit.max(1) as f64;
            let wait_ms = ((1.0 - tokens) * per_token_ms).ceil() as u64;
            RuleOutcome {
                allowed: false,
                limit: eff_limit,
                remaining: 0,
                reset_at: (now_ms + wait_ms).div_ceil(1000),
                hits: eff_limit,
            }
        }
    }

    /// Burst sub-rule: a short sliding count layered under the primary rule.
    async fn eval_burst(
        &self,
        rule_name: &str,
        key: &AdmissionKey,
        burst: &BurstConfig,
        now_ms: u64,
    ) -> RuleOutcome {
        let state_key = format!("bp:{}:{}", rule_name, key);
        self.eval_sliding(&state_key, burst.limit, burst.window, now_ms).await
    }
}

#[async_trait]
impl AdmissionCheck for RateLimitEngine {
    async fn check(&self, key: &AdmissionKey, endpoint: &str) -> Verdict {
        self.check_scaled(key, endpoint, 1.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rules::SlidingWindowRule;
    use crate::store::{CounterBackend, StoreError};

    fn engine_with(rules: RuleSet) -> (RateLimitEngine, ManualClock) {
        let clock = ManualClock::starting_at(1_000_000);
        let engine =
            RateLimitEngine::with_clock(CounterStore::in_process(), rules, Arc::new(clock.clone()));
        (engine, clock)
    }

    fn fixed(name: &str, pattern: &str, limit: u32, window_ms: u64) -> Rule {
        Rule::FixedWindow(FixedWindowRule::new(
            name,
            pattern,
            limit,
            Duration::from_millis(window_ms),
        ))
    }

    #[tokio::test]
    async fn fixed_window_denies_sixth_call_and_rolls_over() {
        let rules = RuleSet::new().with(fixed("api", "/api/*", 5, 60_000));
        let (engine, clock) = engine_with(rules);
        let key = AdmissionKey::compose("/api/generate", "user-1");

        for i in 0..5u32 {
            let v = engine.check(&key, "/api/generate").await;
            assert!(v.allowed, "call {} should be allowed", i + 1);
            assert_eq!(v.limit, 5);
            assert_eq!(v.remaining, 4 - i);
        }

        let denied = engine.check(&key, "/api/generate").await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Reason::RateLimitExceeded);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.total_hits, 6);

        // Window rolls over: fresh slot, fresh counter.
        clock.advance(Duration::from_millis(60_000));
        let v = engine.check(&key, "/api/generate").await;
        assert!(v.allowed);
        assert_eq!(v.remaining, 4);
    }

    #[tokio::test]
    async fn sliding_window_is_precise_at_the_boundary() {
        let rules = RuleSet::new().with(Rule::SlidingWindow(SlidingWindowRule::new(
            "strict",
            "/api/strict",
            3,
            Duration::from_millis(1000),
        )));
        let (engine, clock) = engine_with(rules);
        let key = AdmissionKey::compose("/api/strict", "user-1");

        for _ in 0..3 {
            assert!(engine.check(&key, "/api/strict").await.allowed);
        }

        clock.advance(Duration::from_millis(500));
        let denied = engine.check(&key, "/api/strict").await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Reason::RateLimitExceeded);

        // First event leaves the window at t=1000; at t=1001 a slot is free.
        clock.advance(Duration::from_millis(501));
        assert!(engine.check(&key, "/api/strict").await.allowed);
    }

    #[tokio::test]
    async fn token_bucket_drains_and_refills() {
        let rules = RuleSet::new().with(Rule::TokenBucket(TokenBucketRule::new(
            "uploads",
            "/api/upload",
            2,
            Duration::from_millis(1000),
        )));
        let (engine, clock) = engine_with(rules);
        let key = AdmissionKey::compose("/api/upload", "user-1");

        assert!(engine.check(&key, "/api/upload").await.allowed);
        assert!(engine.check(&key, "/api/upload").await.allowed);
        let denied = engine.check(&key, "/api/upload").await;
        assert!(!denied.allowed);

        // Half a window refills one token at limit=2.
        clock.advance(Duration::from_millis(500));
        assert!(engine.check(&key, "/api/upload").await.allowed);
        assert!(!engine.check(&key, "/api/upload").await.allowed);
    }

    #[tokio::test]
    async fn burst_rule_overrides_primary_allowance() {
        let rules = RuleSet::new().with(Rule::FixedWindow(
            FixedWindowRule::new("auth", "/api/auth/*", 100, Duration::from_secs(900))
                .priority(10)
                .burst(3, Duration::from_secs(60)),
        ));
        let (engine, _clock) = engine_with(rules);
        let key = AdmissionKey::compose("/api/auth/login", "203.0.113.9");

        for _ in 0..3 {
            assert!(engine.check(&key, "/api/auth/login").await.allowed);
        }
        let denied = engine.check(&key, "/api/auth/login").await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Reason::BurstLimitExceeded);
        assert_eq!(denied.limit, 3);
    }

    #[tokio::test]
    async fn all_matching_rules_accrue_usage() {
        let rules = RuleSet::new()
            .with(fixed("global", "*", 10, 60_000))
            .with(Rule::FixedWindow(
                FixedWindowRule::new("tight", "/api/x", 2, Duration::from_millis(60_000))
                    .priority(5),
            ));
        let (engine, _clock) = engine_with(rules);
        let key = AdmissionKey::new("user-1");

        assert!(engine.check(&key, "/api/x").await.allowed);
        assert!(engine.check(&key, "/api/x").await.allowed);
        assert!(!engine.check(&key, "/api/x").await.allowed);

        // The global rule counted all three /api/x checks; a fourth hit
        // elsewhere sees 10 - 4 remaining.
        let v = engine.check(&key, "/other").await;
        assert!(v.allowed);
        assert_eq!(v.remaining, 6);
    }

    #[tokio::test]
    async fn governing_rule_wins_over_lower_priority_denial() {
        let rules = RuleSet::new()
            .with(Rule::FixedWindow(
                FixedWindowRule::new("generous", "/api/x", 5, Duration::from_millis(60_000))
                    .priority(10),
            ))
            .with(fixed("stingy", "*", 1, 60_000));
        let (engine, _clock) = engine_with(rules);
        let key = AdmissionKey::new("user-1");

        assert!(engine.check(&key, "/api/x").await.allowed);
        // The low-priority rule is over budget, but the governing verdict allows.
        let v = engine.check(&key, "/api/x").await;
        assert!(v.allowed);
        assert_eq!(v.remaining, 0);
    }

    #[tokio::test]
    async fn no_matching_rules_is_unlimited() {
        let (engine, _clock) = engine_with(RuleSet::new());
        let v = engine.check(&AdmissionKey::new("k"), "/anything").await;
        assert!(v.allowed);
        assert_eq!(v.reason, Reason::Allowed);
        assert_eq!(v.limit, u32::MAX);
    }

    #[tokio::test]
    async fn corrupt_window_state_fails_open() {
        let rules = RuleSet::new().with(Rule::SlidingWindow(SlidingWindowRule::new(
            "strict",
            "/api/strict",
            3,
            Duration::from_millis(1000),
        )));
        let store = CounterStore::in_process();
        let clock = ManualClock::starting_at(1_000_000);
        let engine =
            RateLimitEngine::with_clock(store.clone(), rules, Arc::new(clock.clone()));
        let key = AdmissionKey::new("user-1");

        store
            .set("sw:strict:user-1", "{definitely-not-json", Duration::from_secs(60))
            .await;
        let v = engine.check(&key, "/api/strict").await;
        assert!(v.allowed);
        assert_eq!(v.remaining, 2);
    }

    /// Backend that fails every call; checks must still answer.
    #[derive(Debug)]
    struct FailingBackend;

    #[async_trait]
    impl CounterBackend for FailingBackend {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn incr(&self, _: &str, _: Duration) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn mget(&self, _: &[String]) -> Result<Vec<Option<String>>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn del(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn clear_prefix(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_outage_fails_open_to_local_counting() {
        let rules = RuleSet::new().with(fixed("api", "/api/*", 5, 60_000));
        let store = CounterStore::with_backend(Arc::new(FailingBackend));
        let clock = ManualClock::starting_at(1_000_000);
        let engine = RateLimitEngine::with_clock(store, rules, Arc::new(clock.clone()));
        let key = AdmissionKey::compose("/api/generate", "user-1");

        // Never an error, never a spurious denial: counting continues locally.
        for _ in 0..5 {
            assert!(engine.check(&key, "/api/generate").await.allowed);
        }
        // Local counting is live, so the per-process limit still binds.
        assert!(!engine.check(&key, "/api/generate").await.allowed);
    }

    #[test]
    fn scale_limit_floors_and_clamps() {
        assert_eq!(scale_limit(100, 1.0), 100);
        assert_eq!(scale_limit(100, 3.0), 300);
        assert_eq!(scale_limit(100, 0.75), 75);
        assert_eq!(scale_limit(1, 0.5), 1);
        assert_eq!(scale_limit(5, 0.5), 2);
    }
}
