//! Canonical rule presets.
//!
//! Pre-tuned limits for common endpoint classes, so services don't each
//! invent their own numbers. Every preset takes the endpoint pattern it
//! should guard and returns a single [`Rule`]; [`default_rules`] is the
//! registration set a typical API process starts with.

use crate::rules::{FixedWindowRule, Rule, RuleSet, SlidingWindowRule, TokenBucketRule};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const QUARTER_HOUR: Duration = Duration::from_secs(15 * 60);
const HOUR: Duration = Duration::from_secs(3600);

/// Very strict: sensitive operations (account deletion, payout changes).
/// 5 requests per 15 minutes.
pub fn strict(pattern: impl Into<String>) -> Rule {
    Rule::FixedWindow(FixedWindowRule::new("strict", pattern, 5, QUARTER_HOUR))
}

/// Authentication endpoints: 20 requests per 15 minutes.
pub fn auth(pattern: impl Into<String>) -> Rule {
    Rule::FixedWindow(FixedWindowRule::new("auth", pattern, 20, QUARTER_HOUR))
}

/// General API traffic: 100 requests per minute.
pub fn api(pattern: impl Into<String>) -> Rule {
    Rule::FixedWindow(FixedWindowRule::new("api", pattern, 100, MINUTE))
}

/// AI generation endpoints: 30 requests per minute, boundary-precise since
/// each admitted call is expensive downstream.
pub fn ai(pattern: impl Into<String>) -> Rule {
    Rule::SlidingWindow(SlidingWindowRule::new("ai", pattern, 30, MINUTE))
}

/// File uploads: 10 requests per minute with token smoothing.
pub fn upload(pattern: impl Into<String>) -> Rule {
    Rule::TokenBucket(TokenBucketRule::new("upload", pattern, 10, MINUTE))
}

/// Search endpoints: 200 requests per minute.
pub fn search(pattern: impl Into<String>) -> Rule {
    Rule::FixedWindow(FixedWindowRule::new("search", pattern, 200, MINUTE))
}

/// Analytics reads: 50 requests per minute.
pub fn analytics(pattern: impl Into<String>) -> Rule {
    Rule::FixedWindow(FixedWindowRule::new("analytics", pattern, 50, MINUTE))
}

/// The default registration set for an API process:
/// a global hourly ceiling, strict auth with burst protection, token-smoothed
/// uploads, and an hourly cap on campaign sends.
pub fn default_rules() -> RuleSet {
    RuleSet::new()
        .with(Rule::SlidingWindow(
            SlidingWindowRule::new("global_api", "/api/*", 1000, HOUR).priority(1),
        ))
        .with(Rule::FixedWindow(
            FixedWindowRule::new("auth_strict", "/api/auth/*", 5, QUARTER_HOUR)
                .priority(10)
                .burst(3, MINUTE),
        ))
        .with(Rule::TokenBucket(
            TokenBucketRule::new("upload_limit", "/api/upload", 50, HOUR).priority(5),
        ))
        .with(Rule::SlidingWindow(
            SlidingWindowRule::new("email_campaigns", "/api/email-campaigns/*", 100, HOUR)
                .priority(3),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_are_priority_ordered() {
        let rules = default_rules();
        let names: Vec<_> = rules.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["auth_strict", "upload_limit", "email_campaigns", "global_api"]);
    }

    #[test]
    fn auth_strict_carries_burst_protection() {
        let rules = default_rules();
        let auth = rules.iter().find(|r| r.name() == "auth_strict").unwrap();
        let burst = auth.burst().unwrap();
        assert_eq!(burst.limit, 3);
        assert_eq!(burst.window, MINUTE);
    }

    #[test]
    fn presets_guard_their_pattern() {
        let rule = ai("/api/generate");
        assert!(rule.matches("/api/generate"));
        assert!(!rule.matches("/api/upload"));
        assert_eq!(rule.limit(), 30);

        let rule = strict("/api/account/delete");
        assert_eq!(rule.limit(), 5);
        assert_eq!(rule.window(), QUARTER_HOUR);
    }

    #[test]
    fn preset_limits_match_the_published_table() {
        assert_eq!(auth("*").limit(), 20);
        assert_eq!(api("*").limit(), 100);
        assert_eq!(upload("*").limit(), 10);
        assert_eq!(search("*").limit(), 200);
        assert_eq!(analytics("*").limit(), 50);
    }
}
