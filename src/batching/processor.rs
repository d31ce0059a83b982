//! # Batch Processor
//!
//! Executes one batch of a single model type on one instance chosen by the
//! load balancer. Concurrency per model is bounded by a semaphore. Failures
//! are batch-atomic: no capacity, an executor error or a malformed executor
//! response fail every item with the same error.

use super::executor::ModelExecutor;
use super::types::{BatchItem, ModelConfig};
use crate::core::error::{OptimizerError, OptimizerResult};
use crate::load_balancing::LoadBalancer;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Per-model execution statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorModelStats {
    pub batches: u64,
    pub items: u64,
    pub failed_batches: u64,
    pub no_capacity: u64,
    /// Seconds
    pub average_latency: f64,
    #[serde(skip)]
    total_latency: f64,
}

/// Marks an instance request as finished, as a failure unless completed
struct InFlight<'a> {
    balancer: &'a LoadBalancer,
    instance_id: String,
    started: Instant,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn start(balancer: &'a LoadBalancer, instance_id: String) -> Self {
        balancer.record_request_start(&instance_id);
        Self {
            balancer,
            instance_id,
            started: Instant::now(),
            done: false,
        }
    }

    fn finish(mut self, success: bool) -> Duration {
        let took = self.started.elapsed();
        self.balancer.record_request_end(&self.instance_id, success, took);
        self.done = true;
        took
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.balancer
                .record_request_end(&self.instance_id, false, self.started.elapsed());
        }
    }
}

pub struct BatchProcessor {
    balancer: Arc<LoadBalancer>,
    executor: Arc<dyn ModelExecutor>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    stats: Mutex<HashMap<String, ProcessorModelStats>>,
}

impl BatchProcessor {
    pub fn new(
        models: &HashMap<String, ModelConfig>,
        balancer: Arc<LoadBalancer>,
        executor: Arc<dyn ModelExecutor>,
    ) -> Self {
        let semaphores = models
            .iter()
            .map(|(name, model)| (name.clone(), Arc::new(Semaphore::new(model.concurrency_limit.max(1)))))
            .collect();

        Self {
            balancer,
            executor,
            semaphores,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Batches of `model_type` that may start right now
    pub fn available_permits(&self, model_type: &str) -> Option<usize> {
        self.semaphores.get(model_type).map(|s| s.available_permits())
    }

    /// Run one batch. The result has one entry per item, in item order.
    pub async fn process_batch(&self, model_type: &str, items: Vec<BatchItem>) -> Vec<OptimizerResult<Value>> {
        if items.is_empty() {
            return Vec::new();
        }
        let count = items.len();

        let Some(semaphore) = self.semaphores.get(model_type) else {
            return fan_out(
                OptimizerError::UnknownModelType {
                    model_type: model_type.to_string(),
                },
                count,
            );
        };

        // Released on every exit path when dropped
        let _permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return fan_out(OptimizerError::ShuttingDown, count),
        };

        let Some(instance) = self.balancer.select_instance(model_type, None) else {
            warn!(model_type = %model_type, batch_size = count, "No capacity for batch");
            counter!("batch_processor_no_capacity_total", "model_type" => model_type.to_string()).increment(1);
            self.update_stats(model_type, |s| s.no_capacity += 1);
            return fan_out(OptimizerError::no_capacity(model_type), count);
        };

        debug!(
            model_type = %model_type,
            instance_id = %instance.instance_id,
            batch_size = count,
            "Executing batch"
        );

        let in_flight = InFlight::start(&self.balancer, instance.instance_id.clone());
        let outcome = self.executor.execute(model_type, &instance, &items).await;

        let results = match outcome {
            Ok(outcomes) if outcomes.len() != count => Err(OptimizerError::batch_execution(
                model_type,
                format!("executor returned {} results for {} items", outcomes.len(), count),
            )),
            Ok(outcomes) => {
                let misordered = outcomes
                    .iter()
                    .zip(&items)
                    .any(|(outcome, item)| outcome.request_id != item.request_id);
                if misordered {
                    Err(OptimizerError::batch_execution(
                        model_type,
                        "executor results do not match request ids",
                    ))
                } else {
                    Ok(outcomes.into_iter().map(|o| o.result).collect::<Vec<_>>())
                }
            }
            Err(e) => Err(e),
        };

        let took = in_flight.finish(results.is_ok());
        histogram!("batch_size", "model_type" => model_type.to_string()).record(count as f64);
        histogram!("batch_duration_seconds", "model_type" => model_type.to_string()).record(took.as_secs_f64());

        match results {
            Ok(results) => {
                self.update_stats(model_type, |s| {
                    s.batches += 1;
                    s.items += count as u64;
                    s.total_latency += took.as_secs_f64();
                    s.average_latency = s.total_latency / s.batches as f64;
                });
                results
            }
            Err(e) => {
                error!(
                    model_type = %model_type,
                    instance_id = %instance.instance_id,
                    batch_size = count,
                    error = %e,
                    "Batch failed"
                );
                counter!("batch_processor_failures_total", "model_type" => model_type.to_string()).increment(1);
                self.update_stats(model_type, |s| {
                    s.batches += 1;
                    s.items += count as u64;
                    s.failed_batches += 1;
                    s.total_latency += took.as_secs_f64();
                    s.average_latency = s.total_latency / s.batches as f64;
                });
                fan_out(e, count)
            }
        }
    }

    pub fn stats(&self) -> BTreeMap<String, ProcessorModelStats> {
        self.stats.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn update_stats(&self, model_type: &str, f: impl FnOnce(&mut ProcessorModelStats)) {
        let mut stats = self.stats.lock();
        f(stats.entry(model_type.to_string()).or_default());
    }
}

fn fan_out(error: OptimizerError, count: usize) -> Vec<OptimizerResult<Value>> {
    vec![Err(error); count]
}
