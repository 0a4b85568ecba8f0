//! Adaptive tiering: per-caller limit scaling and global load shedding.
//!
//! [`TieredEngine`] wraps the rate limit engine and passes a request-scoped
//! limit factor into every check — tier multiplier times the current load
//! shed factor. Shared rule state is never mutated, so concurrent requests
//! under different tiers cannot observe each other's effective limits.

use crate::adaptive::DynamicConfig;
use crate::engine::{AdmissionCheck, RateLimitEngine, Verdict};
use crate::rules::AdmissionKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Error type for tier lookups; failures fall back to the default tier.
pub type ResolveError = Box<dyn std::error::Error + Send + Sync>;

/// Caller tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

/// Per-tier limit multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierMultipliers {
    pub free: f64,
    pub pro: f64,
    pub enterprise: f64,
}

impl Default for TierMultipliers {
    fn default() -> Self {
        Self { free: 1.0, pro: 3.0, enterprise: 10.0 }
    }
}

impl TierMultipliers {
    pub fn factor(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// Resolves a caller's tier, typically from a subscription record.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn resolve(&self, key: &AdmissionKey) -> Result<Tier, ResolveError>;
}

/// Resolver that assigns every caller the same tier.
#[derive(Debug, Clone, Copy)]
pub struct StaticTier(pub Tier);

#[async_trait]
impl TierResolver for StaticTier {
    async fn resolve(&self, _key: &AdmissionKey) -> Result<Tier, ResolveError> {
        Ok(self.0)
    }
}

/// Transitions require this many consecutive qualifying samples.
const SUSTAIN_SAMPLES: u32 = 3;

#[derive(Debug, Default)]
struct ShedState {
    pending: f64,
    streak: u32,
}

/// Global limit scaling under self-induced overload.
///
/// Factor levels are 1.0 → 0.75 → 0.5. Degradation triggers above 60% / 80%
/// load; recovery is one step at a time and only 10 points below the
/// degradation threshold, each after [`SUSTAIN_SAMPLES`] consecutive
/// samples — hysteresis so the factor cannot oscillate on a noisy probe.
#[derive(Debug)]
pub struct LoadShedder {
    factor: DynamicConfig<f64>,
    state: Mutex<ShedState>,
}

impl Default for LoadShedder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadShedder {
    pub fn new() -> Self {
        Self { factor: DynamicConfig::new(1.0), state: Mutex::new(ShedState::default()) }
    }

    /// Current global limit factor.
    pub fn factor(&self) -> f64 {
        *self.factor.get()
    }

    /// Feed one load sample (percent, 0–100).
    pub fn observe(&self, load_pct: f64) {
        let current = self.factor();
        let target = if load_pct > 80.0 {
            0.5
        } else if load_pct > 60.0 {
            current.min(0.75)
        } else if current <= 0.5 && load_pct < 70.0 {
            0.75
        } else if current <= 0.75 && load_pct < 50.0 {
            1.0
        } else {
            current
        };

        let mut state = self.state.lock().unwrap();
        if (target - current).abs() < f64::EPSILON {
            state.streak = 0;
            state.pending = current;
            return;
        }
        if (state.pending - target).abs() > f64::EPSILON {
            state.pending = target;
            state.streak = 1;
        } else {
            state.streak += 1;
        }
        if state.streak >= SUSTAIN_SAMPLES {
            state.streak = 0;
            self.factor.set(target);
            tracing::info!(factor = target, load_pct, "load shed factor adjusted");
        }
    }
}

/// Tier-aware admission engine.
pub struct TieredEngine {
    engine: RateLimitEngine,
    resolver: Arc<dyn TierResolver>,
    multipliers: TierMultipliers,
    default_tier: Tier,
    cache: Mutex<HashMap<String, (Tier, Instant)>>,
    cache_ttl: Duration,
    shedder: LoadShedder,
}

/// How long a resolved tier is trusted before asking the resolver again.
const DEFAULT_TIER_CACHE_TTL: Duration = Duration::from_secs(30);

impl TieredEngine {
    pub fn new(engine: RateLimitEngine, resolver: Arc<dyn TierResolver>) -> Self {
        Self {
            engine,
            resolver,
            multipliers: TierMultipliers::default(),
            default_tier: Tier::Free,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DEFAULT_TIER_CACHE_TTL,
            shedder: LoadShedder::new(),
        }
    }

    pub fn with_multipliers(mut self, multipliers: TierMultipliers) -> Self {
        self.multipliers = multipliers;
        self
    }

    pub fn with_default_tier(mut self, tier: Tier) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// The load shedder; feed it probe samples from wherever load is measured.
    pub fn shedder(&self) -> &LoadShedder {
        &self.shedder
    }

    pub fn engine(&self) -> &RateLimitEngine {
        &self.engine
    }

    /// Check with the caller's tier factored in.
    pub async fn check(&self, key: &AdmissionKey, endpoint: &str) -> Verdict {
        let tier = self.tier_for(key).await;
        let factor = self.multipliers.factor(tier) * self.shedder.factor();
        self.engine.check_scaled(key, endpoint, factor).await
    }

    async fn tier_for(&self, key: &AdmissionKey) -> Tier {
        let now = Instant::now();
        {
            let cache = self.cache.lock().unwrap();
            if let Some((tier, resolved_at)) = cache.get(key.as_str()) {
                if now.duration_since(*resolved_at) < self.cache_ttl {
                    return *tier;
                }
            }
        }

        match self.resolver.resolve(key).await {
            Ok(tier) => {
                let mut cache = self.cache.lock().unwrap();
                cache.insert(key.as_str().to_string(), (tier, now));
                tier
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "tier lookup failed, using default tier");
                self.default_tier
            }
        }
    }
}

#[async_trait]
impl AdmissionCheck for TieredEngine {
    async fn check(&self, key: &AdmissionKey, endpoint: &str) -> Verdict {
        TieredEngine::check(self, key, endpoint).await
    }
}
