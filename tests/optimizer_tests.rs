//! # Production Optimizer Integration Tests
//!
//! End-to-end request flow through cache, batcher, processor and load
//! balancer with injected collaborators.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use production_optimizer::batching::{BatchItem, ItemOutcome, ModelExecutor};
use production_optimizer::caching::CacheKey;
use production_optimizer::load_balancing::{LoadBalancingAlgorithm, StaticHealthProbe};
use production_optimizer::optimizer::{DatabaseExecutor, GenericHandler};
use production_optimizer::{
    ConfigManager, OptimizedRequest, OptimizerConfig, OptimizerError, OptimizerResult, ProductionOptimizer,
    RequestPriority, ServiceInstance,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct BatchRecorder {
    batch_sizes: Mutex<Vec<usize>>,
}

#[async_trait]
impl ModelExecutor for BatchRecorder {
    async fn execute(
        &self,
        model_type: &str,
        instance: &ServiceInstance,
        items: &[BatchItem],
    ) -> OptimizerResult<Vec<ItemOutcome>> {
        self.batch_sizes.lock().push(items.len());
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(items
            .iter()
            .map(|i| {
                ItemOutcome::ok(
                    i.request_id.clone(),
                    json!({"model": model_type, "instance": instance.instance_id, "echo": i.payload}),
                )
            })
            .collect())
    }
}

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl GenericHandler for CountingHandler {
    async fn handle(&self, request_type: &str, payload: &Value) -> OptimizerResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"type": request_type, "score": payload["score"]}))
    }
}

/// Fails every query containing "DROP"
struct GuardedDatabase;

#[async_trait]
impl DatabaseExecutor for GuardedDatabase {
    async fn execute(&self, query: &str, _params: &Value) -> OptimizerResult<Value> {
        if query.contains("DROP") {
            return Err(OptimizerError::invalid_request("destructive statements are not allowed"));
        }
        Ok(json!({"rows": [[1]], "row_count": 1}))
    }
}

fn analysis_config() -> OptimizerConfig {
    let mut config = OptimizerConfig::default();
    config
        .routing
        .cache_types
        .insert("financial_analysis".to_string(), "financial_analysis".to_string());
    config
}

#[tokio::test(start_paused = true)]
async fn test_cache_hit_skips_handler() {
    let handler = Arc::new(CountingHandler::default());
    let optimizer = ProductionOptimizer::builder(analysis_config())
        .with_generic_handler(handler.clone())
        .build()
        .unwrap();

    let request = OptimizedRequest::new("financial_analysis", json!({"score": 85.5}))
        .with_cache_params(CacheKey::params([("company", "acme")]));

    let first = optimizer.process_request(request.clone()).await;
    let second = optimizer.process_request(request).await;

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.data, Some(json!({"type": "financial_analysis", "score": 85.5})));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let status = optimizer.status().await;
    assert_eq!(status.cache.hits, 1);
    assert_eq!(status.sla.cached_responses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_recorded_and_not_cached() {
    let optimizer = ProductionOptimizer::builder(OptimizerConfig::default())
        .with_database_executor(Arc::new(GuardedDatabase))
        .build()
        .unwrap();
    let params = CacheKey::params([("table", "reports")]);

    let failed = optimizer
        .process_request(OptimizedRequest::database("DROP TABLE reports", json!({})).with_cache_params(params.clone()))
        .await;
    assert!(!failed.success);
    assert!(!optimizer.cache().exists("database_queries", &params).await.unwrap());

    let ok = optimizer
        .process_request(OptimizedRequest::database("SELECT 1", json!({})).with_cache_params(params.clone()))
        .await;
    assert!(ok.success);
    assert!(optimizer.cache().exists("database_queries", &params).await.unwrap());

    let sla = optimizer.sla().snapshot();
    assert_eq!(sla.total_requests, 2);
    assert_eq!(sla.failed_requests, 1);
    assert!((sla.success_rate - 0.5).abs() < f64::EPSILON);
    assert!(!sla.compliant);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_model_requests_share_batches() {
    let recorder = Arc::new(BatchRecorder::default());
    let optimizer = ProductionOptimizer::builder(OptimizerConfig::default())
        .with_model_executor(recorder.clone())
        .with_health_probe(Arc::new(StaticHealthProbe::healthy()))
        .build()
        .unwrap();
    optimizer.start().await.unwrap();

    let requests = (0..8).map(|i| {
        optimizer.process_request(OptimizedRequest::ai(json!({"prompt": i})).with_model("llm-fast"))
    });
    let responses = join_all(requests).await;

    for (i, response) in responses.iter().enumerate() {
        assert!(response.success, "{:?}", response.error);
        let data = response.data.as_ref().unwrap();
        assert_eq!(data["model"], "llm-fast");
        assert_eq!(data["echo"]["prompt"], i);
    }
    let batches = recorder.batch_sizes.lock().clone();
    assert!(batches.len() < 8, "batches: {:?}", batches);
    assert_eq!(batches.iter().sum::<usize>(), 8);

    optimizer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_model_resolution_and_priority() {
    let recorder = Arc::new(BatchRecorder::default());
    let optimizer = ProductionOptimizer::builder(OptimizerConfig::default())
        .with_model_executor(recorder)
        .with_health_probe(Arc::new(StaticHealthProbe::healthy()))
        .build()
        .unwrap();
    optimizer.start().await.unwrap();

    let from_payload = optimizer
        .process_request(OptimizedRequest::ai(json!({"model": "embedding", "text": "q3 results"})))
        .await;
    assert_eq!(from_payload.into_result().unwrap()["model"], "embedding");

    let default_model = optimizer
        .process_request(OptimizedRequest::ai(json!({"text": "hi"})).with_priority(RequestPriority::Critical))
        .await;
    assert_eq!(default_model.into_result().unwrap()["model"], "llm-fast");

    let unknown = optimizer
        .process_request(OptimizedRequest::ai(json!({})).with_model("gpt-unknown"))
        .await;
    assert!(matches!(unknown.error, Some(OptimizerError::UnknownModelType { .. })));

    optimizer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_bootstraps_pools_and_reports_status() {
    let optimizer = ProductionOptimizer::builder(OptimizerConfig::default())
        .with_health_probe(Arc::new(StaticHealthProbe::healthy()))
        .build()
        .unwrap();
    optimizer.start().await.unwrap();

    let status = optimizer.status().await;
    assert!(status.running);
    assert!(status.cache_health.is_healthy());
    for model in ["llm-large", "llm-fast", "embedding"] {
        assert_eq!(optimizer.load_balancer().healthy_count(model), 2, "{}", model);
    }
    assert_eq!(status.load_balancer.instances.len(), 6);

    optimizer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_provisioned_instances_use_configured_weight() {
    let mut config = OptimizerConfig::default();
    config.load_balancing.default_weight = 2.5;
    let optimizer = ProductionOptimizer::builder(config)
        .with_health_probe(Arc::new(StaticHealthProbe::healthy()))
        .build()
        .unwrap();
    optimizer.start().await.unwrap();

    let instances = optimizer.load_balancer().instances("embedding");
    assert!(!instances.is_empty());
    assert!(instances.iter().all(|i| (i.weight - 2.5).abs() < f64::EPSILON));

    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_config_reload_switches_algorithm() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(b"load_balancing:\n  algorithm: round_robin\n").unwrap();
    file.flush().unwrap();

    let manager = ConfigManager::without_watcher(file.path()).await.unwrap();
    let optimizer = ProductionOptimizer::new(manager.get_config().await.clone()).unwrap();
    optimizer.spawn_config_listener(manager.subscribe_to_changes());

    let mut updated = manager.get_config().await.clone();
    updated.load_balancing.algorithm = LoadBalancingAlgorithm::Weighted;
    manager.update_config(updated).await.unwrap();

    for _ in 0..100 {
        if optimizer.load_balancer().algorithm() == LoadBalancingAlgorithm::Weighted {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(optimizer.load_balancer().algorithm(), LoadBalancingAlgorithm::Weighted);

    optimizer.shutdown().await;
}
