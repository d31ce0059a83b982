//! Batching configuration and request records.

use crate::core::error::{OptimizerError, OptimizerResult};
use crate::core::types::RequestPriority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// When a model queue flushes into the batch processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchingStrategy {
    /// Fire when the queue holds `max_batch_size` requests
    SizeBased,
    /// Fire only when the model timer expires
    TimeBased,
    /// Fire immediately on a critical request, otherwise by size
    PriorityBased,
    /// Fire at the ideal size, or early when throughput is high
    #[default]
    Adaptive,
}

impl BatchingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchingStrategy::SizeBased => "size_based",
            BatchingStrategy::TimeBased => "time_based",
            BatchingStrategy::PriorityBased => "priority_based",
            BatchingStrategy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for BatchingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchingStrategy {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "size_based" | "size" => Ok(BatchingStrategy::SizeBased),
            "time_based" | "time" => Ok(BatchingStrategy::TimeBased),
            "priority_based" | "priority" => Ok(BatchingStrategy::PriorityBased),
            "adaptive" => Ok(BatchingStrategy::Adaptive),
            other => Err(OptimizerError::config(format!("Unknown batching strategy: {}", other))),
        }
    }
}

/// Per-model batching and capacity settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Upper bound on requests per batch
    pub max_batch_size: usize,

    /// Target size for the adaptive strategy
    pub ideal_batch_size: usize,

    /// Timer armed when the queue turns non-empty
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Batches of this model allowed to execute at once
    pub concurrency_limit: usize,

    /// Simulated fixed cost of one batch
    #[serde(with = "humantime_serde")]
    pub base_latency: Duration,

    /// Simulated cost of each item in a batch
    #[serde(with = "humantime_serde")]
    pub per_item_latency: Duration,

    /// Instances registered for the model at startup
    pub initial_instances: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            ideal_batch_size: 8,
            batch_timeout: Duration::from_secs(1),
            concurrency_limit: 5,
            base_latency: Duration::from_millis(200),
            per_item_latency: Duration::from_millis(10),
            initial_instances: 2,
        }
    }
}

impl ModelConfig {
    /// Simulated execution time of a batch of `items`
    pub fn simulated_latency(&self, items: usize) -> Duration {
        let items = u32::try_from(items).unwrap_or(u32::MAX);
        self.base_latency.saturating_add(self.per_item_latency.saturating_mul(items))
    }

    pub fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_batch_size == 0 {
            errors.push(format!("model '{}': max_batch_size must be at least 1", name));
        }
        if self.ideal_batch_size == 0 || self.ideal_batch_size > self.max_batch_size {
            errors.push(format!(
                "model '{}': ideal_batch_size must be in 1..={}",
                name, self.max_batch_size
            ));
        }
        if self.concurrency_limit == 0 {
            errors.push(format!("model '{}': concurrency_limit must be at least 1", name));
        }
        if self.batch_timeout.is_zero() {
            errors.push(format!("model '{}': batch_timeout must be non-zero", name));
        }
        errors
    }
}

/// Tuning of the adaptive strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Fraction of the ideal size at which a hot model fires early
    pub early_fire_ratio: f64,

    /// Items per second above which a model counts as hot
    pub throughput_threshold: f64,

    /// Completed batches considered for throughput
    pub throughput_window: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            early_fire_ratio: 0.7,
            throughput_threshold: 5.0,
            throughput_window: 5,
        }
    }
}

/// Request batcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub strategy: BatchingStrategy,

    /// Interval of the background flush check
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Timeout for requests that do not carry their own
    #[serde(with = "humantime_serde")]
    pub default_request_timeout: Duration,

    pub adaptive: AdaptiveConfig,

    pub models: HashMap<String, ModelConfig>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        let model = |max, ideal, timeout_ms, concurrency, base_ms, item_ms| ModelConfig {
            max_batch_size: max,
            ideal_batch_size: ideal,
            batch_timeout: Duration::from_millis(timeout_ms),
            concurrency_limit: concurrency,
            base_latency: Duration::from_millis(base_ms),
            per_item_latency: Duration::from_millis(item_ms),
            initial_instances: 2,
        };

        let models = HashMap::from([
            ("llm-large".to_string(), model(8, 4, 2000, 2, 800, 50)),
            ("llm-fast".to_string(), model(16, 8, 1000, 5, 200, 10)),
            ("embedding".to_string(), model(32, 16, 500, 10, 50, 2)),
        ]);

        Self {
            strategy: BatchingStrategy::Adaptive,
            tick_interval: Duration::from_millis(100),
            default_request_timeout: Duration::from_secs(30),
            adaptive: AdaptiveConfig::default(),
            models,
        }
    }
}

impl BatchingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.models.is_empty() {
            errors.push("batching: at least one model must be configured".to_string());
        }
        if self.tick_interval.is_zero() {
            errors.push("batching: tick_interval must be non-zero".to_string());
        }
        if self.default_request_timeout.is_zero() {
            errors.push("batching: default_request_timeout must be non-zero".to_string());
        }
        if !(self.adaptive.early_fire_ratio > 0.0 && self.adaptive.early_fire_ratio <= 1.0) {
            errors.push("batching: adaptive.early_fire_ratio must be in (0, 1]".to_string());
        }
        if self.adaptive.throughput_window == 0 {
            errors.push("batching: adaptive.throughput_window must be at least 1".to_string());
        }
        for (name, model) in &self.models {
            errors.extend(model.validate(name));
        }
        errors
    }
}

/// A unit of work for a model
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub request_id: String,
    pub model_type: String,
    pub payload: Value,
    pub priority: RequestPriority,
    /// Falls back to the batcher default when unset
    pub timeout: Option<Duration>,
}

impl BatchRequest {
    pub fn new(model_type: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            model_type: model_type.into(),
            payload,
            priority: RequestPriority::Normal,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// What the executor sees of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub request_id: String,
    pub payload: Value,
}

/// Executor result for one item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub request_id: String,
    pub result: OptimizerResult<Value>,
}

impl ItemOutcome {
    pub fn ok(request_id: impl Into<String>, value: Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: Ok(value),
        }
    }

    pub fn err(request_id: impl Into<String>, error: OptimizerError) -> Self {
        Self {
            request_id: request_id.into(),
            result: Err(error),
        }
    }
}
