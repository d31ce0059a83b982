//! Model execution seam.
//!
//! The contract of an executor is one call per batch: it receives the
//! `(request_id, payload)` pairs and returns one outcome per item, in the
//! same order. A returned `Err` fails the whole batch.

use super::types::{BatchItem, ItemOutcome, ModelConfig};
use crate::core::error::{OptimizerError, OptimizerResult};
use crate::core::types::ServiceInstance;
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[async_trait]
pub trait ModelExecutor: Send + Sync {
    async fn execute(
        &self,
        model_type: &str,
        instance: &ServiceInstance,
        items: &[BatchItem],
    ) -> OptimizerResult<Vec<ItemOutcome>>;
}

/// Sleeps for the model's configured latency and echoes the payloads
pub struct SimulatedModelExecutor {
    models: HashMap<String, ModelConfig>,
    failure_rate: f64,
}

impl SimulatedModelExecutor {
    pub fn new(models: HashMap<String, ModelConfig>) -> Self {
        Self {
            models,
            failure_rate: 0.0,
        }
    }

    /// Probability in [0, 1] that a whole batch fails
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    fn latency(&self, model_type: &str, items: usize) -> Duration {
        self.models
            .get(model_type)
            .map(|m| m.simulated_latency(items))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelExecutor for SimulatedModelExecutor {
    async fn execute(
        &self,
        model_type: &str,
        instance: &ServiceInstance,
        items: &[BatchItem],
    ) -> OptimizerResult<Vec<ItemOutcome>> {
        tokio::time::sleep(self.latency(model_type, items.len())).await;

        let failed = self.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.failure_rate;
        if failed {
            return Err(OptimizerError::batch_execution(
                model_type,
                format!("simulated transport failure on {}", instance.endpoint()),
            ));
        }

        Ok(items
            .iter()
            .map(|item| {
                ItemOutcome::ok(
                    item.request_id.clone(),
                    json!({
                        "model": model_type,
                        "instance_id": instance.instance_id,
                        "batch_size": items.len(),
                        "output": item.payload,
                    }),
                )
            })
            .collect())
    }
}
