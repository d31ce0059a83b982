//! Pluggable handlers for non-model requests.

use crate::core::error::{OptimizerError, OptimizerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Executes `database` requests
#[async_trait]
pub trait DatabaseExecutor: Send + Sync {
    async fn execute(&self, query: &str, params: &Value) -> OptimizerResult<Value>;

    /// Drop per-query bookkeeping older than `retention`; returns entries removed
    fn cleanup_metrics(&self, _retention: Duration) -> usize {
        0
    }
}

/// Handles every request type without a dedicated path
#[async_trait]
pub trait GenericHandler: Send + Sync {
    async fn handle(&self, request_type: &str, payload: &Value) -> OptimizerResult<Value>;
}

/// Aggregates for one query text
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetrics {
    pub executions: u64,
    /// Seconds
    pub average_duration: f64,
    pub last_executed: DateTime<Utc>,
    #[serde(skip)]
    last_seen: Instant,
    #[serde(skip)]
    total_duration: f64,
}

/// Sleeps for a fixed latency and returns an empty row set
pub struct SimulatedDatabaseExecutor {
    latency: Duration,
    metrics: Mutex<HashMap<String, QueryMetrics>>,
}

impl SimulatedDatabaseExecutor {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn query_metrics(&self) -> BTreeMap<String, QueryMetrics> {
        self.metrics.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn record(&self, query: &str, took: Duration) {
        let secs = took.as_secs_f64();
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(query.to_string()).or_insert_with(|| QueryMetrics {
            executions: 0,
            average_duration: 0.0,
            last_executed: Utc::now(),
            last_seen: Instant::now(),
            total_duration: 0.0,
        });
        entry.executions += 1;
        entry.total_duration += secs;
        entry.average_duration = entry.total_duration / entry.executions as f64;
        entry.last_executed = Utc::now();
        entry.last_seen = Instant::now();
    }
}

impl Default for SimulatedDatabaseExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

#[async_trait]
impl DatabaseExecutor for SimulatedDatabaseExecutor {
    async fn execute(&self, query: &str, params: &Value) -> OptimizerResult<Value> {
        if query.trim().is_empty() {
            return Err(OptimizerError::invalid_request("database query must not be empty"));
        }

        let started = Instant::now();
        tokio::time::sleep(self.latency).await;
        self.record(query, started.elapsed());

        Ok(json!({
            "query": query,
            "params": params,
            "rows": [],
            "row_count": 0,
        }))
    }

    fn cleanup_metrics(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut metrics = self.metrics.lock();
        let before = metrics.len();
        metrics.retain(|_, m| now.saturating_duration_since(m.last_seen) <= retention);
        let removed = before - metrics.len();
        if removed > 0 {
            debug!(removed, "Pruned query metrics");
        }
        removed
    }
}

/// Echoes the payload back with the request type
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl GenericHandler for EchoHandler {
    async fn handle(&self, request_type: &str, payload: &Value) -> OptimizerResult<Value> {
        Ok(json!({
            "request_type": request_type,
            "payload": payload,
        }))
    }
}
