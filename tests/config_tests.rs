//! # Configuration Integration Tests
//!
//! File loading, validation and reload broadcasts.

use production_optimizer::batching::BatchingStrategy;
use production_optimizer::load_balancing::LoadBalancingAlgorithm;
use production_optimizer::{ConfigManager, OptimizerConfig, OptimizerError};
use std::io::Write;
use std::time::Duration;
use tempfile::{Builder, NamedTempFile};
use tokio_test::{assert_err, assert_ok};

const PARTIAL_YAML: &str = r#"
load_balancing:
  algorithm: least_connections
  health_check_interval: 10s
batching:
  strategy: priority_based
  models:
    summarizer:
      max_batch_size: 4
      ideal_batch_size: 2
      batch_timeout: 250ms
      concurrency_limit: 1
routing:
  default_model: summarizer
scaling:
  policies:
    summarizer:
      min_instances: 1
      max_instances: 3
      scale_up_cooldown: 2m
"#;

fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_partial_yaml_fills_in_defaults() {
    let file = write_temp(".yaml", PARTIAL_YAML);
    let config = OptimizerConfig::load_from_file(file.path()).await.unwrap();

    assert_eq!(config.load_balancing.algorithm, LoadBalancingAlgorithm::LeastConnections);
    assert_eq!(config.load_balancing.health_check_interval, Duration::from_secs(10));
    assert_eq!(config.batching.strategy, BatchingStrategy::PriorityBased);

    let summarizer = &config.batching.models["summarizer"];
    assert_eq!(summarizer.max_batch_size, 4);
    assert_eq!(summarizer.batch_timeout, Duration::from_millis(250));
    assert_eq!(config.batching.models.len(), 1);

    let policy = &config.scaling.policies["summarizer"];
    assert_eq!(policy.scale_up_cooldown, Duration::from_secs(120));
    assert_eq!(policy.target_cpu, 70.0);

    assert_eq!(config.cache.cache_types.len(), 6);
    assert_eq!(config.maintenance.expired_sweep_interval, Duration::from_secs(60));
}

#[tokio::test]
async fn test_json_config_is_selected_by_extension() {
    let json = serde_json::to_string_pretty(&OptimizerConfig::default()).unwrap();
    let file = write_temp(".json", &json);

    let config = OptimizerConfig::load(file.path()).await.unwrap();
    assert_eq!(config.batching.models.len(), 3);
    assert_eq!(config.routing.default_model, "llm-fast");
}

#[tokio::test]
async fn test_invalid_file_is_rejected_with_every_problem() {
    let file = write_temp(
        ".yaml",
        r#"
scaling:
  policies:
    llm-fast:
      min_instances: 5
      max_instances: 2
routing:
  default_model: missing-model
"#,
    );

    let err = OptimizerConfig::load_from_file(file.path()).await.unwrap_err();
    let OptimizerError::Configuration { message } = err else {
        panic!("expected a configuration error, got {:?}", err);
    };
    assert!(message.contains("min_instances"));
    assert!(message.contains("missing-model"));
}

#[tokio::test]
async fn test_missing_and_malformed_files() {
    assert_err!(OptimizerConfig::load_from_file("/nonexistent/optimizer.yaml").await);

    let file = write_temp(".yaml", "load_balancing: [not, a, map]");
    let err = OptimizerConfig::load_from_file(file.path()).await.unwrap_err();
    assert!(err.to_string().contains("Failed to parse config"));
}

#[tokio::test]
async fn test_reload_broadcasts_new_configuration() {
    let file = write_temp(".yaml", PARTIAL_YAML);
    let manager = ConfigManager::without_watcher(file.path()).await.unwrap();
    let mut changes = manager.subscribe_to_changes();

    std::fs::write(file.path(), PARTIAL_YAML.replace("least_connections", "ip_hash")).unwrap();
    assert_ok!(manager.reload_config().await);

    let event = changes.recv().await.unwrap();
    assert_eq!(event.config.load_balancing.algorithm, LoadBalancingAlgorithm::IpHash);
    assert_eq!(manager.get_config().await.load_balancing.algorithm, LoadBalancingAlgorithm::IpHash);
}

#[tokio::test]
async fn test_rejected_reload_keeps_previous_configuration() {
    let file = write_temp(".yaml", PARTIAL_YAML);
    let manager = ConfigManager::without_watcher(file.path()).await.unwrap();

    std::fs::write(file.path(), "batching:\n  tick_interval: 0s\n").unwrap();
    assert_err!(manager.reload_config().await);
    assert_eq!(
        manager.get_config().await.load_balancing.algorithm,
        LoadBalancingAlgorithm::LeastConnections
    );
}
