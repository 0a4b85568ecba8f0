//! Rule vocabulary: admission keys, per-algorithm rule types, and rule sets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identifier for the principal being rate-limited.
///
/// Composed deterministically from caller identity plus endpoint/operation
/// name (`"endpoint:identifier"`). Equality is exact string equality; the
/// core performs no normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdmissionKey(String);

impl AdmissionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The conventional `"endpoint:identifier"` composition.
    pub fn compose(endpoint: &str, identifier: &str) -> Self {
        Self(format!("{}:{}", endpoint, identifier))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdmissionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Short-interval sub-limit layered under a rule's primary limit.
///
/// Exists to catch pathological short-interval hammering that a long window
/// smooths over; a denying burst rule overrides any primary verdict,
/// regardless of declared priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstConfig {
    pub limit: u32,
    pub window: Duration,
}

macro_rules! algorithm_rule {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            pub name: String,
            /// Endpoint pattern the rule applies to; `*` matches any span.
            pub endpoint_pattern: String,
            pub limit: u32,
            pub window: Duration,
            /// Higher priority governs when several rules match.
            pub priority: i32,
            pub burst: Option<BurstConfig>,
        }

        impl $name {
            pub fn new(
                name: impl Into<String>,
                endpoint_pattern: impl Into<String>,
                limit: u32,
                window: Duration,
            ) -> Self {
                Self {
                    name: name.into(),
                    endpoint_pattern: endpoint_pattern.into(),
                    limit,
                    window,
                    priority: 0,
                    burst: None,
                }
            }

            pub fn priority(mut self, priority: i32) -> Self {
                self.priority = priority;
                self
            }

            pub fn burst(mut self, limit: u32, window: Duration) -> Self {
                self.burst = Some(BurstConfig { limit, window });
                self
            }
        }
    };
}

algorithm_rule! {
    /// Counter plus window-start slot. Cheap, but admits up to `2 × limit`
    /// across a window boundary — the accepted tradeoff for high-volume,
    /// low-priority rules.
    FixedWindowRule
}

algorithm_rule! {
    /// Ordered list of event timestamps inside the lookback interval. Bounds
    /// bursts precisely at the window boundary at O(window) cost per check;
    /// use where boundary precision matters.
    SlidingWindowRule
}

algorithm_rule! {
    /// Token balance replenished continuously at `limit / window`, one token
    /// consumed per admitted call.
    TokenBucketRule
}

/// A named admission policy, discriminated by algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    FixedWindow(FixedWindowRule),
    SlidingWindow(SlidingWindowRule),
    TokenBucket(TokenBucketRule),
}

impl Rule {
    pub fn name(&self) -> &str {
        match self {
            Rule::FixedWindow(r) => &r.name,
            Rule::SlidingWindow(r) => &r.name,
            Rule::TokenBucket(r) => &r.name,
        }
    }

    pub fn endpoint_pattern(&self) -> &str {
        match self {
            Rule::FixedWindow(r) => &r.endpoint_pattern,
            Rule::SlidingWindow(r) => &r.endpoint_pattern,
            Rule::TokenBucket(r) => &r.endpoint_pattern,
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            Rule::FixedWindow(r) => r.limit,
            Rule::SlidingWindow(r) => r.limit,
            Rule::TokenBucket(r) => r.limit,
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            Rule::FixedWindow(r) => r.window,
            Rule::SlidingWindow(r) => r.window,
            Rule::TokenBucket(r) => r.window,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Rule::FixedWindow(r) => r.priority,
            Rule::SlidingWindow(r) => r.priority,
            Rule::TokenBucket(r) => r.priority,
        }
    }

    pub fn burst(&self) -> Option<&BurstConfig> {
        match self {
            Rule::FixedWindow(r) => r.burst.as_ref(),
            Rule::SlidingWindow(r) => r.burst.as_ref(),
            Rule::TokenBucket(r) => r.burst.as_ref(),
        }
    }

    /// Whether this rule applies to `endpoint`.
    pub fn matches(&self, endpoint: &str) -> bool {
        pattern_matches(self.endpoint_pattern(), endpoint)
    }
}

/// `*`-wildcard matching: `*` alone matches everything, otherwise each `*`
/// matches any (possibly empty) span of the endpoint.
fn pattern_matches(pattern: &str, endpoint: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == endpoint;
    }

    let mut rest = endpoint;
    let mut pieces = pattern.split('*').peekable();

    // Anchored prefix before the first `*`.
    if let Some(first) = pieces.next() {
        if !rest.starts_with(first) {
            return false;
        }
        rest = &rest[first.len()..];
    }

    while let Some(piece) = pieces.next() {
        if piece.is_empty() {
            continue;
        }
        if pieces.peek().is_none() && !pattern.ends_with('*') {
            // Anchored suffix after the last `*`.
            return rest.ends_with(piece);
        }
        match rest.find(piece) {
            Some(idx) => rest = &rest[idx + piece.len()..],
            None => return false,
        }
    }
    true
}

/// Ordered set of registered rules.
///
/// Registration keeps the set sorted by priority, highest first, so iteration
/// order is evaluation order and the first matching rule is the governing one.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Rule) {
        let at = self
            .rules
            .partition_point(|existing| existing.priority() >= rule.priority());
        self.rules.insert(at, rule);
    }

    /// Builder-style registration.
    pub fn with(mut self, rule: Rule) -> Self {
        self.register(rule);
        self
    }

    /// All rules applying to `endpoint`, priority descending.
    pub fn matching(&self, endpoint: &str) -> Vec<&Rule> {
        self.rules.iter().filter(|r| r.matches(endpoint)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_key_composition() {
        let key = AdmissionKey::compose("/api/generate", "203.0.113.7");
        assert_eq!(key.as_str(), "/api/generate:203.0.113.7");
        assert_eq!(key, AdmissionKey::new("/api/generate:203.0.113.7"));
        assert_ne!(key, AdmissionKey::new("/api/generate:203.0.113.8"));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(pattern_matches("*", "/anything"));
        assert!(pattern_matches("/api/auth/*", "/api/auth/login"));
        assert!(pattern_matches("/api/*", "/api/upload"));
        assert!(!pattern_matches("/api/auth/*", "/api/upload"));
        assert!(pattern_matches("/api/upload", "/api/upload"));
        assert!(!pattern_matches("/api/upload", "/api/uploads"));
        assert!(pattern_matches("*/admin", "/api/v2/admin"));
        assert!(pattern_matches("/api/*/tasks", "/api/projects/tasks"));
        assert!(!pattern_matches("/api/*/tasks", "/api/projects/users"));
    }

    #[test]
    fn rule_set_orders_by_priority() {
        let set = RuleSet::new()
            .with(Rule::FixedWindow(
                FixedWindowRule::new("global", "*", 1000, Duration::from_secs(3600)).priority(1),
            ))
            .with(Rule::FixedWindow(
                FixedWindowRule::new("auth", "/api/auth/*", 5, Duration::from_secs(900))
                    .priority(10),
            ))
            .with(Rule::SlidingWindow(
                SlidingWindowRule::new("api", "/api/*", 100, Duration::from_secs(60)).priority(5),
            ));

        let matched = set.matching("/api/auth/login");
        let names: Vec<_> = matched.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["auth", "api", "global"]);

        let matched = set.matching("/health");
        let names: Vec<_> = matched.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["global"]);
    }

    #[test]
    fn registration_is_stable_for_equal_priorities() {
        let set = RuleSet::new()
            .with(Rule::FixedWindow(
                FixedWindowRule::new("first", "*", 10, Duration::from_secs(60)).priority(5),
            ))
            .with(Rule::FixedWindow(
                FixedWindowRule::new("second", "*", 10, Duration::from_secs(60)).priority(5),
            ));
        let names: Vec<_> = set.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn burst_builder_attaches_config() {
        let rule = Rule::FixedWindow(
            FixedWindowRule::new("auth", "/api/auth/*", 5, Duration::from_secs(900))
                .burst(3, Duration::from_secs(60)),
        );
        let burst = rule.burst().unwrap();
        assert_eq!(burst.limit, 3);
        assert_eq!(burst.window, Duration::from_secs(60));
    }
}
