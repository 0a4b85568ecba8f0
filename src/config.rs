//! Configuration surface.
//!
//! The core consumes these records at process start; it does not own the
//! source (file, env, or an ops service). Everything is plain serde
//! `Deserialize` so the caller can feed JSON, TOML, or anything else.

use crate::batcher::{RequestBatcher, DEFAULT_BATCH_SIZE};
use crate::dedup::RequestDeduplicator;
use crate::pool::ConnectionPool;
use crate::rules::{FixedWindowRule, Rule, RuleSet, SlidingWindowRule, TokenBucketRule};
use crate::tiering::TierMultipliers;
use serde::Deserialize;
use std::time::Duration;

/// Algorithm tag for a configured rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmConfig {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

fn default_pattern() -> String {
    "*".to_string()
}

/// One registered rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default = "default_pattern")]
    pub endpoint: String,
    pub limit: u32,
    pub window_ms: u64,
    pub algorithm: AlgorithmConfig,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub burst_limit: Option<u32>,
    #[serde(default)]
    pub burst_window_ms: Option<u64>,
}

impl RuleConfig {
    pub fn into_rule(self) -> Rule {
        let window = Duration::from_millis(self.window_ms);
        let burst = match (self.burst_limit, self.burst_window_ms) {
            (Some(limit), Some(window_ms)) => Some((limit, Duration::from_millis(window_ms))),
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!(
                    rule = %self.name,
                    "burst config needs both burst_limit and burst_window_ms; ignoring"
                );
                None
            }
            (None, None) => None,
        };

        macro_rules! build {
            ($kind:ident, $variant:ident) => {{
                let mut rule =
                    $kind::new(self.name, self.endpoint, self.limit, window).priority(self.priority);
                if let Some((limit, window)) = burst {
                    rule = rule.burst(limit, window);
                }
                Rule::$variant(rule)
            }};
        }

        match self.algorithm {
            AlgorithmConfig::FixedWindow => build!(FixedWindowRule, FixedWindow),
            AlgorithmConfig::SlidingWindow => build!(SlidingWindowRule, SlidingWindow),
            AlgorithmConfig::TokenBucket => build!(TokenBucketRule, TokenBucket),
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub max_connections: usize,
    #[serde(default = "PoolConfig::default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    fn default_acquire_timeout_ms() -> u64 {
        30_000
    }

    pub fn build(&self) -> ConnectionPool {
        ConnectionPool::with_timeout(
            self.max_connections,
            Duration::from_millis(self.acquire_timeout_ms),
        )
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_connections: 10, acquire_timeout_ms: Self::default_acquire_timeout_ms() }
    }
}

/// Batcher sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "BatchConfig::default_max_size")]
    pub max_size: usize,
    #[serde(default = "BatchConfig::default_flush_after_ms")]
    pub flush_after_ms: u64,
}

impl BatchConfig {
    fn default_max_size() -> usize {
        DEFAULT_BATCH_SIZE
    }

    fn default_flush_after_ms() -> u64 {
        1_000
    }

    pub fn build<P, T, E>(&self) -> RequestBatcher<P, T, E>
    where
        P: Send + 'static,
        T: Send + 'static,
        E: Send + Sync + 'static,
    {
        RequestBatcher::new(self.max_size, Duration::from_millis(self.flush_after_ms))
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_size: Self::default_max_size(), flush_after_ms: Self::default_flush_after_ms() }
    }
}

/// Deduplicator sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "DedupConfig::default_ttl_ms")]
    pub ttl_ms: u64,
}

impl DedupConfig {
    fn default_ttl_ms() -> u64 {
        5_000
    }

    pub fn build<T, E>(&self) -> RequestDeduplicator<T, E> {
        RequestDeduplicator::new(Duration::from_millis(self.ttl_ms))
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_ms: Self::default_ttl_ms() }
    }
}

/// Everything the admission core consumes at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub tiers: TierMultipliers,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

impl AdmissionConfig {
    /// Build the registered rule set.
    pub fn rule_set(&self) -> RuleSet {
        let mut set = RuleSet::new();
        for rule in self.rules.iter().cloned() {
            set.register(rule.into_rule());
        }
        set
    }
}
