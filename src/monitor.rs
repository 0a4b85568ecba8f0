//! Monitoring facade: rolling real-time statistics and threshold alerts.
//!
//! A read-only consumer of admission outcomes. Callers record one sample per
//! unit of work; the facade aggregates the last five minutes into
//! [`RealTimeMetrics`] and raises [`Alert`]s when thresholds are crossed.
//! Nothing here may ever gate an admission decision.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling aggregation window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Hard cap on retained samples; the window prunes long before this under
/// normal load.
const MAX_SAMPLES: usize = 100_000;

const RESPONSE_TIME_WARN_MS: f64 = 5_000.0;
const RESPONSE_TIME_CRITICAL_MS: f64 = 10_000.0;
const ERROR_RATE_WARN_PCT: f64 = 5.0;
const ERROR_RATE_CRITICAL_PCT: f64 = 15.0;
const CACHE_HIT_WARN_PCT: f64 = 30.0;
const CACHE_HIT_CRITICAL_PCT: f64 = 15.0;
/// Cache-hit alerts only fire once there is enough traffic to mean anything.
const CACHE_HIT_MIN_LOAD: usize = 10;

#[derive(Debug, Clone)]
struct Sample {
    service: String,
    duration: Duration,
    success: bool,
    cache_hit: bool,
    at: Instant,
}

/// Snapshot of the last window.
#[derive(Debug, Clone, PartialEq)]
pub struct RealTimeMetrics {
    /// Samples inside the window.
    pub current_load: usize,
    pub avg_response_time_ms: f64,
    pub error_rate_pct: f64,
    pub cache_hit_rate_pct: f64,
    pub active_services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    HighResponseTime,
    HighErrorRate,
    LowCacheHitRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

/// Rolling-window performance monitor.
#[derive(Debug)]
pub struct PerformanceMonitor {
    window: Duration,
    samples: Mutex<VecDeque<Sample>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self { window, samples: Mutex::new(VecDeque::new()) }
    }

    /// Record one completed unit of work.
    pub fn record(&self, service: &str, duration: Duration, success: bool, cache_hit: bool) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        Self::prune(&mut samples, now, self.window);
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(Sample {
            service: service.to_string(),
            duration,
            success,
            cache_hit,
            at: now,
        });
    }

    fn prune(samples: &mut VecDeque<Sample>, now: Instant, window: Duration) {
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Metrics over the current window.
    pub fn metrics(&self) -> RealTimeMetrics {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        Self::prune(&mut samples, now, self.window);

        let current_load = samples.len();
        if current_load == 0 {
            return RealTimeMetrics {
                current_load: 0,
                avg_response_time_ms: 0.0,
                error_rate_pct: 0.0,
                cache_hit_rate_pct: 0.0,
                active_services: Vec::new(),
            };
        }

        let total_ms: f64 = samples.iter().map(|s| s.duration.as_secs_f64() * 1000.0).sum();
        let failures = samples.iter().filter(|s| !s.success).count();
        let cache_hits = samples.iter().filter(|s| s.cache_hit).count();

        let mut active_services: Vec<String> = Vec::new();
        for sample in samples.iter() {
            if !active_services.iter().any(|s| s == &sample.service) {
                active_services.push(sample.service.clone());
            }
        }

        RealTimeMetrics {
            current_load,
            avg_response_time_ms: total_ms / current_load as f64,
            error_rate_pct: failures as f64 / current_load as f64 * 100.0,
            cache_hit_rate_pct: cache_hits as f64 / current_load as f64 * 100.0,
            active_services,
        }
    }

    /// Threshold alerts over the current window.
    pub fn alerts(&self) -> Vec<Alert> {
        let metrics = self.metrics();
        let mut alerts = Vec::new();

        if metrics.avg_response_time_ms > RESPONSE_TIME_WARN_MS {
            alerts.push(Alert {
                kind: AlertKind::HighResponseTime,
                severity: if metrics.avg_response_time_ms > RESPONSE_TIME_CRITICAL_MS {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                message: format!(
                    "Average response time is {:.0}ms",
                    metrics.avg_response_time_ms
                ),
                value: metrics.avg_response_time_ms,
                threshold: RESPONSE_TIME_WARN_MS,
            });
        }

        if metrics.error_rate_pct > ERROR_RATE_WARN_PCT {
            alerts.push(Alert {
                kind: AlertKind::HighErrorRate,
                severity: if metrics.error_rate_pct > ERROR_RATE_CRITICAL_PCT {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                message: format!("Error rate is {:.1}%", metrics.error_rate_pct),
                value: metrics.error_rate_pct,
                threshold: ERROR_RATE_WARN_PCT,
            });
        }

        if metrics.cache_hit_rate_pct < CACHE_HIT_WARN_PCT
            && metrics.current_load > CACHE_HIT_MIN_LOAD
        {
            alerts.push(Alert {
                kind: AlertKind::LowCacheHitRate,
                severity: if metrics.cache_hit_rate_pct < CACHE_HIT_CRITICAL_PCT {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                message: format!("Cache hit rate is {:.1}%", metrics.cache_hit_rate_pct),
                value: metrics.cache_hit_rate_pct,
                threshold: CACHE_HIT_WARN_PCT,
            });
        }

        alerts
    }
}
