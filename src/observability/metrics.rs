//! # Metrics and SLA Tracking
//!
//! Request-level instrumentation goes through the `metrics` facade; without
//! an installed recorder the macros are no-ops. The [`SlaTracker`] keeps an
//! in-process view of the same numbers for status reporting.

use crate::core::error::{OptimizerError, OptimizerResult};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub prometheus_enabled: bool,
    /// Listen address of the scrape endpoint
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: false,
            listen_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Vec<String> {
        match self.listen_address.parse::<SocketAddr>() {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("metrics: invalid listen_address '{}': {}", self.listen_address, e)],
        }
    }
}

/// Install the global Prometheus recorder with an HTTP scrape listener
pub fn install_prometheus_exporter(config: &MetricsConfig) -> OptimizerResult<()> {
    let addr: SocketAddr = config
        .listen_address
        .parse()
        .map_err(|e| OptimizerError::config(format!("Invalid metrics listen address: {}", e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), LATENCY_BUCKETS)
        .map_err(|e| OptimizerError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install()
        .map_err(|e| OptimizerError::internal(format!("Failed to install Prometheus exporter: {}", e)))?;

    info!(listen_address = %addr, "Prometheus exporter listening");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    #[serde(with = "humantime_serde")]
    pub target_response_time: Duration,
    /// Fraction in [0, 1]
    pub target_success_rate: f64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            target_response_time: Duration::from_secs(2),
            target_success_rate: 0.99,
        }
    }
}

impl SlaConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.target_response_time.is_zero() {
            errors.push("sla: target_response_time must be non-zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.target_success_rate) {
            errors.push("sla: target_success_rate must be in [0, 1]".to_string());
        }
        errors
    }
}

#[derive(Debug, Default)]
struct SlaCounters {
    total: u64,
    successful: u64,
    failed: u64,
    cached: u64,
    total_time: f64,
    max_time: f64,
}

/// Point-in-time SLA figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cached_responses: u64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    /// Seconds
    pub average_response_time: f64,
    /// Seconds
    pub max_response_time: f64,
    pub compliant: bool,
}

pub struct SlaTracker {
    config: SlaConfig,
    counters: Mutex<SlaCounters>,
}

impl SlaTracker {
    pub fn new(config: SlaConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(SlaCounters::default()),
        }
    }

    pub fn config(&self) -> &SlaConfig {
        &self.config
    }

    /// Record one finished request
    pub fn record_request(&self, request_type: &str, response_time: Duration, success: bool, cached: bool) {
        let secs = response_time.as_secs_f64();
        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            if success {
                counters.successful += 1;
            } else {
                counters.failed += 1;
            }
            if cached {
                counters.cached += 1;
            }
            counters.total_time += secs;
            counters.max_time = counters.max_time.max(secs);
        }

        let outcome = if success { "success" } else { "failure" };
        counter!(
            "optimizer_requests_total",
            "request_type" => request_type.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        if cached {
            counter!("optimizer_cache_hits_total", "request_type" => request_type.to_string()).increment(1);
        }
        histogram!(
            "optimizer_request_duration_seconds",
            "request_type" => request_type.to_string()
        )
        .record(secs);
    }

    pub fn snapshot(&self) -> SlaSnapshot {
        let counters = self.counters.lock();
        let total = counters.total.max(1) as f64;
        let success_rate = if counters.total == 0 {
            1.0
        } else {
            counters.successful as f64 / total
        };
        let average_response_time = if counters.total == 0 {
            0.0
        } else {
            counters.total_time / total
        };

        SlaSnapshot {
            total_requests: counters.total,
            successful_requests: counters.successful,
            failed_requests: counters.failed,
            cached_responses: counters.cached,
            success_rate,
            cache_hit_rate: if counters.total == 0 { 0.0 } else { counters.cached as f64 / total },
            average_response_time,
            max_response_time: counters.max_time,
            compliant: success_rate >= self.config.target_success_rate
                && average_response_time <= self.config.target_response_time.as_secs_f64(),
        }
    }

    pub fn reset(&self) {
        *self.counters.lock() = SlaCounters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tracker_is_compliant() {
        let snapshot = SlaTracker::new(SlaConfig::default()).snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.compliant);
    }

    #[test]
    fn test_success_rate_breach() {
        let tracker = SlaTracker::new(SlaConfig {
            target_success_rate: 0.9,
            ..Default::default()
        });
        for _ in 0..8 {
            tracker.record_request("ai_model", Duration::from_millis(100), true, false);
        }
        tracker.record_request("ai_model", Duration::from_millis(300), false, false);
        tracker.record_request("ai_model", Duration::from_millis(100), true, true);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_requests, 10);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.cached_responses, 1);
        assert!((snapshot.success_rate - 0.9).abs() < 1e-9);
        assert!((snapshot.average_response_time - 0.12).abs() < 1e-9);
        assert!((snapshot.max_response_time - 0.3).abs() < 1e-9);
        assert!(snapshot.compliant);

        tracker.record_request("ai_model", Duration::from_millis(100), false, false);
        assert!(!tracker.snapshot().compliant);
    }

    #[test]
    fn test_latency_breach() {
        let tracker = SlaTracker::new(SlaConfig {
            target_response_time: Duration::from_millis(50),
            ..Default::default()
        });
        tracker.record_request("database", Duration::from_millis(80), true, false);
        assert!(!tracker.snapshot().compliant);
    }

    #[test]
    fn test_metrics_config_validation() {
        assert!(MetricsConfig::default().validate().is_empty());
        let bad = MetricsConfig {
            listen_address: "not-an-address".to_string(),
            ..Default::default()
        };
        assert_eq!(bad.validate().len(), 1);
    }
}
