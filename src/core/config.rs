//! # Configuration Module
//!
//! Typed configuration for the whole optimizer with hot reloading.
//!
//! ## Key Features
//! - YAML/JSON parsing with serde; durations use humantime strings (`"30s"`)
//! - Environment variable overrides (`OPTIMIZER_*`)
//! - Validation at load time with every problem reported at once
//! - File watching through `notify` and change broadcasts to subscribers

use crate::batching::{BatchingConfig, BatchingStrategy};
use crate::caching::CacheConfig;
use crate::core::error::{OptimizerError, OptimizerResult};
use crate::load_balancing::{LoadBalancerConfig, LoadBalancingAlgorithm};
use crate::observability::{LogFormat, LoggingConfig, MetricsConfig, SlaConfig};
use crate::scaling::ScalingConfig;
use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Maps request types onto cache types and models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Cache type used for each request type; unmapped types are not cached
    pub cache_types: HashMap<String, String>,

    /// Model used by `ai_model` requests that do not name one
    pub default_model: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cache_types: HashMap::from([
                ("ai_model".to_string(), "ai_responses".to_string()),
                ("database".to_string(), "database_queries".to_string()),
            ]),
            default_model: "llm-fast".to_string(),
        }
    }
}

/// Intervals of the background maintenance loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    #[serde(with = "humantime_serde")]
    pub cache_stats_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub expired_sweep_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub db_metrics_cleanup_interval: Duration,

    /// Query metrics unseen for longer than this are dropped
    #[serde(with = "humantime_serde")]
    pub db_metrics_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cache_stats_interval: Duration::from_secs(300),
            expired_sweep_interval: Duration::from_secs(60),
            db_metrics_cleanup_interval: Duration::from_secs(3600),
            db_metrics_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Complete optimizer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub cache: CacheConfig,
    pub load_balancing: LoadBalancerConfig,
    pub scaling: ScalingConfig,
    pub batching: BatchingConfig,
    pub routing: RoutingConfig,
    pub maintenance: MaintenanceConfig,
    pub sla: SlaConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> OptimizerResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| OptimizerError::config(format!("Invalid {}: {}", name, e))),
        None => Ok(None),
    }
}

fn duration_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> OptimizerResult<Option<Duration>> {
    match lookup(name) {
        Some(raw) => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|e| OptimizerError::config(format!("Invalid {}: {}", name, e))),
        None => Ok(None),
    }
}

impl OptimizerConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> OptimizerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| OptimizerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: OptimizerConfig = serde_yaml::from_str(&content)
            .map_err(|e| OptimizerError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> OptimizerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| OptimizerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: OptimizerConfig = serde_json::from_str(&content)
            .map_err(|e| OptimizerError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load by file extension: `.json` is JSON, anything else YAML
    pub async fn load<P: AsRef<Path>>(path: P) -> OptimizerResult<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Apply `OPTIMIZER_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> OptimizerResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> OptimizerResult<()> {
        // Distributed cache
        let redis = &mut self.cache.redis;
        if let Some(enabled) = parse_var::<bool>(&lookup, "OPTIMIZER_REDIS_ENABLED")? {
            redis.enabled = enabled;
        }
        if let Some(url) = lookup("OPTIMIZER_REDIS_URL") {
            redis.url = Some(url);
            redis.enabled = true;
        }
        if let Some(host) = lookup("OPTIMIZER_REDIS_HOST") {
            redis.host = host;
        }
        if let Some(port) = parse_var(&lookup, "OPTIMIZER_REDIS_PORT")? {
            redis.port = port;
        }
        if let Some(db) = parse_var(&lookup, "OPTIMIZER_REDIS_DB")? {
            redis.db = db;
        }
        if let Some(password) = lookup("OPTIMIZER_REDIS_PASSWORD") {
            redis.password = Some(password);
        }
        if let Some(timeout) = duration_var(&lookup, "OPTIMIZER_REDIS_OPERATION_TIMEOUT")? {
            redis.operation_timeout = timeout;
        }

        if let Some(entries) = parse_var(&lookup, "OPTIMIZER_MEMORY_MAX_ENTRIES")? {
            self.cache.memory_max_entries = entries;
        }

        // Load balancing
        if let Some(algorithm) = parse_var::<LoadBalancingAlgorithm>(&lookup, "OPTIMIZER_LB_ALGORITHM")? {
            self.load_balancing.algorithm = algorithm;
        }
        if let Some(interval) = duration_var(&lookup, "OPTIMIZER_HEALTH_CHECK_INTERVAL")? {
            self.load_balancing.health_check_interval = interval;
        }

        // Batching
        if let Some(strategy) = parse_var::<BatchingStrategy>(&lookup, "OPTIMIZER_BATCHING_STRATEGY")? {
            self.batching.strategy = strategy;
        }
        if let Some(timeout) = duration_var(&lookup, "OPTIMIZER_REQUEST_TIMEOUT")? {
            self.batching.default_request_timeout = timeout;
        }

        // Logging and metrics
        if let Some(level) = lookup("OPTIMIZER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = parse_var::<LogFormat>(&lookup, "OPTIMIZER_LOG_FORMAT")? {
            self.logging.format = format;
        }
        if let Some(enabled) = parse_var::<bool>(&lookup, "OPTIMIZER_PROMETHEUS_ENABLED")? {
            self.metrics.prometheus_enabled = enabled;
        }
        if let Some(address) = lookup("OPTIMIZER_PROMETHEUS_ADDRESS") {
            self.metrics.listen_address = address;
        }

        Ok(())
    }

    /// Validate every section, reporting all problems in one error
    pub fn validate(&self) -> OptimizerResult<()> {
        let mut errors = Vec::new();

        if let Err(cache_errors) = self.cache.validate() {
            errors.extend(cache_errors);
        }

        let lb = &self.load_balancing;
        if lb.health_check_interval.is_zero() {
            errors.push("load_balancing.health_check_interval must be non-zero".to_string());
        }
        if lb.circuit_breaker.max_retries == 0 {
            errors.push("load_balancing.circuit_breaker.max_retries must be at least 1".to_string());
        }
        if lb.default_weight.is_nan() || lb.default_weight <= 0.0 {
            errors.push("load_balancing.default_weight must be positive".to_string());
        }

        if self.scaling.evaluation_interval.is_zero() {
            errors.push("scaling.evaluation_interval must be non-zero".to_string());
        }
        for (name, policy) in &self.scaling.policies {
            errors.extend(policy.validate(name));
        }

        errors.extend(self.batching.validate());

        for (request_type, cache_type) in &self.routing.cache_types {
            if !self.cache.cache_types.contains_key(cache_type) {
                errors.push(format!(
                    "routing: request type '{}' maps to unknown cache type '{}'",
                    request_type, cache_type
                ));
            }
        }
        if !self.batching.models.contains_key(&self.routing.default_model) {
            errors.push(format!(
                "routing.default_model '{}' has no batching configuration",
                self.routing.default_model
            ));
        }

        let maintenance = &self.maintenance;
        if maintenance.cache_stats_interval.is_zero()
            || maintenance.expired_sweep_interval.is_zero()
            || maintenance.db_metrics_cleanup_interval.is_zero()
        {
            errors.push("maintenance intervals must be non-zero".to_string());
        }

        errors.extend(self.sla.validate());
        errors.extend(self.logging.validate());
        errors.extend(self.metrics.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OptimizerError::config(format!(
                "Configuration validation failed: {}",
                errors.join("; ")
            )))
        }
    }
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    /// Path of the changed configuration file
    pub file_path: PathBuf,
    /// New configuration
    pub config: OptimizerConfig,
    pub timestamp: DateTime<Utc>,
}

/// Configuration manager with hot reloading
///
/// Holds the current configuration, re-reads the file on demand or when the
/// watcher reports a change, and broadcasts every accepted configuration.
/// A reload that fails to parse or validate keeps the previous configuration.
pub struct ConfigManager {
    current_config: Arc<RwLock<OptimizerConfig>>,
    config_path: PathBuf,
    _watcher: Option<notify::RecommendedWatcher>,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
}

impl ConfigManager {
    /// Load the file and start watching it
    pub async fn new<P: AsRef<Path>>(config_path: P) -> OptimizerResult<Self> {
        let mut manager = Self::without_watcher(config_path).await?;
        manager.setup_file_watcher()?;
        Ok(manager)
    }

    /// Load the file; reloads only happen through [`ConfigManager::reload_config`]
    pub async fn without_watcher<P: AsRef<Path>>(config_path: P) -> OptimizerResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = OptimizerConfig::load(&config_path).await?;
        let (change_sender, _) = broadcast::channel(16);

        Ok(Self {
            current_config: Arc::new(RwLock::new(config)),
            config_path,
            _watcher: None,
            change_sender,
        })
    }

    pub async fn get_config(&self) -> tokio::sync::RwLockReadGuard<'_, OptimizerConfig> {
        self.current_config.read().await
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_sender.subscribe()
    }

    /// Re-read the file and apply it
    pub async fn reload_config(&self) -> OptimizerResult<()> {
        tracing::info!(path = ?self.config_path, "Reloading configuration");
        let new_config = OptimizerConfig::load(&self.config_path).await?;
        self.update_config(new_config).await
    }

    /// Validate, store and broadcast a configuration
    pub async fn update_config(&self, new_config: OptimizerConfig) -> OptimizerResult<()> {
        new_config.validate()?;
        Self::apply(&self.current_config, &self.change_sender, &self.config_path, new_config).await;
        Ok(())
    }

    async fn apply(
        current: &RwLock<OptimizerConfig>,
        sender: &broadcast::Sender<ConfigChangeEvent>,
        path: &Path,
        new_config: OptimizerConfig,
    ) {
        *current.write().await = new_config.clone();

        let event = ConfigChangeEvent {
            file_path: path.to_path_buf(),
            config: new_config,
            timestamp: Utc::now(),
        };
        // No subscribers is fine
        let _ = sender.send(event);

        tracing::info!("Configuration updated");
    }

    fn setup_file_watcher(&mut self) -> OptimizerResult<()> {
        let config_path = self.config_path.clone();
        let current_config = Arc::clone(&self.current_config);
        let change_sender = self.change_sender.clone();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| OptimizerError::config(format!("Failed to create file watcher: {}", e)))?;

        // Editors replace files by rename, so watch the directory
        if let Some(parent_dir) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            watcher
                .watch(parent_dir, RecursiveMode::NonRecursive)
                .map_err(|e| OptimizerError::config(format!("Failed to watch config directory: {}", e)))?;
        }
        self._watcher = Some(watcher);

        let config_file_name = config_path
            .file_name()
            .ok_or_else(|| OptimizerError::config("Invalid config file path"))?
            .to_owned();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let ours = event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(config_file_name.as_os_str()));
                if !ours || !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }

                // Let the writer finish
                tokio::time::sleep(Duration::from_millis(100)).await;

                match OptimizerConfig::load(&config_path).await {
                    Ok(new_config) => {
                        Self::apply(&current_config, &change_sender, &config_path, new_config).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Configuration reload rejected");
                    }
                }
            }
        });

        tracing::info!(path = ?self.config_path, "Watching configuration file");
        Ok(())
    }
}
