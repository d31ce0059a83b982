//! # Production Optimizer
//!
//! Composition root that owns one instance of every subsystem and threads
//! them together behind [`ProductionOptimizer::process_request`]:
//!
//! 1. look the request up in the cache when cache parameters are given
//! 2. on a miss, dispatch by request type (`ai_model` to the batcher,
//!    `database` to the database executor, anything else to the generic handler)
//! 3. store successful results back into the cache
//! 4. record every outcome in the SLA tracker
//!
//! Background work (health checks, auto-scaling, batch ticks and cache/DB
//! maintenance) runs in tasks spawned by [`ProductionOptimizer::start`] and
//! stopped by [`ProductionOptimizer::shutdown`].

use super::handlers::{DatabaseExecutor, EchoHandler, GenericHandler, SimulatedDatabaseExecutor};
use crate::batching::{
    BatchProcessor, BatchRequest, BatcherStats, ModelExecutor, ProcessorModelStats, RequestBatcher,
    SimulatedModelExecutor,
};
use crate::caching::cache_manager::CacheHealth;
use crate::caching::{CacheManager, CacheParams, CacheStats, CacheStore};
use crate::core::config::{ConfigChangeEvent, OptimizerConfig};
use crate::core::error::{OptimizerError, OptimizerResult};
use crate::core::types::RequestPriority;
use crate::load_balancing::health::spawn_health_check_loop;
use crate::load_balancing::{HealthProbe, LoadBalancer, LoadBalancerStats, SimulatedHealthProbe};
use crate::observability::{SlaSnapshot, SlaTracker};
use crate::scaling::{AutoScaler, InstanceProvisioner, SimulatedProvisioner};
use futures::future::join_all;
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request type routed through the batcher
pub const AI_MODEL_REQUEST: &str = "ai_model";
/// Request type routed to the database executor
pub const DATABASE_REQUEST: &str = "database";

/// A request entering the optimizer
#[derive(Debug, Clone)]
pub struct OptimizedRequest {
    pub request_type: String,
    pub payload: Value,
    /// Cache lookup parameters; `None` bypasses the cache
    pub cache_params: Option<CacheParams>,
    pub priority: RequestPriority,
    /// Model for `ai_model` requests; falls back to `payload["model"]`, then the routing default
    pub model_type: Option<String>,
    /// Overrides the batcher's default request timeout
    pub timeout: Option<Duration>,
}

impl OptimizedRequest {
    pub fn new(request_type: impl Into<String>, payload: Value) -> Self {
        Self {
            request_type: request_type.into(),
            payload,
            cache_params: None,
            priority: RequestPriority::default(),
            model_type: None,
            timeout: None,
        }
    }

    pub fn ai(payload: Value) -> Self {
        Self::new(AI_MODEL_REQUEST, payload)
    }

    pub fn database(query: impl Into<String>, params: Value) -> Self {
        Self::new(
            DATABASE_REQUEST,
            serde_json::json!({ "query": query.into(), "params": params }),
        )
    }

    pub fn with_cache_params(mut self, params: CacheParams) -> Self {
        self.cache_params = Some(params);
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = Some(model_type.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of [`ProductionOptimizer::process_request`]
#[derive(Debug, Clone)]
pub struct ProcessResponse {
    pub request_id: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<OptimizerError>,
    /// Served from the cache
    pub cached: bool,
    pub response_time: Duration,
}

impl ProcessResponse {
    pub fn into_result(self) -> OptimizerResult<Value> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Snapshot of every subsystem
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStatus {
    pub running: bool,
    pub cache: CacheStats,
    pub cache_health: CacheHealth,
    pub load_balancer: LoadBalancerStats,
    pub batcher: BatcherStats,
    pub processor: BTreeMap<String, ProcessorModelStats>,
    pub sla: SlaSnapshot,
    pub scaling_events: usize,
}

/// Builds a [`ProductionOptimizer`] with optional custom collaborators
pub struct OptimizerBuilder {
    config: OptimizerConfig,
    model_executor: Option<Arc<dyn ModelExecutor>>,
    health_probe: Option<Arc<dyn HealthProbe>>,
    provisioner: Option<Arc<dyn InstanceProvisioner>>,
    database: Option<Arc<dyn DatabaseExecutor>>,
    generic: Option<Arc<dyn GenericHandler>>,
    distributed_cache: Option<Arc<dyn CacheStore>>,
}

impl OptimizerBuilder {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            model_executor: None,
            health_probe: None,
            provisioner: None,
            database: None,
            generic: None,
            distributed_cache: None,
        }
    }

    pub fn with_model_executor(mut self, executor: Arc<dyn ModelExecutor>) -> Self {
        self.model_executor = Some(executor);
        self
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn InstanceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_database_executor(mut self, database: Arc<dyn DatabaseExecutor>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_generic_handler(mut self, handler: Arc<dyn GenericHandler>) -> Self {
        self.generic = Some(handler);
        self
    }

    /// Use `store` as the distributed level instead of the configured Redis backend
    pub fn with_distributed_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.distributed_cache = Some(store);
        self
    }

    /// Validate the configuration and wire every subsystem
    pub fn build(self) -> OptimizerResult<ProductionOptimizer> {
        self.config.validate()?;
        let config = self.config;

        let cache = match self.distributed_cache {
            Some(store) => CacheManager::with_distributed(config.cache.clone(), Some(store)),
            None => CacheManager::new(config.cache.clone()),
        };

        let balancer = Arc::new(LoadBalancer::new(config.load_balancing.clone()));
        let provisioner = self
            .provisioner
            .unwrap_or_else(|| {
                Arc::new(SimulatedProvisioner::default().with_weight(config.load_balancing.default_weight))
            });
        let scaler = Arc::new(AutoScaler::new(config.scaling.clone(), balancer.clone(), provisioner));

        let executor = self
            .model_executor
            .unwrap_or_else(|| Arc::new(SimulatedModelExecutor::new(config.batching.models.clone())));
        let processor = Arc::new(BatchProcessor::new(&config.batching.models, balancer.clone(), executor));
        let batcher = RequestBatcher::new(config.batching.clone(), processor.clone());

        info!(
            cache_types = config.cache.cache_types.len(),
            models = config.batching.models.len(),
            algorithm = %config.load_balancing.algorithm,
            strategy = %config.batching.strategy,
            "Production optimizer configured"
        );

        Ok(ProductionOptimizer {
            sla: Arc::new(SlaTracker::new(config.sla.clone())),
            cache: Arc::new(cache),
            balancer,
            scaler,
            processor,
            batcher,
            database: self
                .database
                .unwrap_or_else(|| Arc::new(SimulatedDatabaseExecutor::default())),
            generic: self.generic.unwrap_or_else(|| Arc::new(EchoHandler)),
            probe: self
                .health_probe
                .unwrap_or_else(|| Arc::new(SimulatedHealthProbe::default())),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            config,
        })
    }
}

/// Coordinates caching, load balancing, scaling and batching
pub struct ProductionOptimizer {
    config: OptimizerConfig,
    cache: Arc<CacheManager>,
    balancer: Arc<LoadBalancer>,
    scaler: Arc<AutoScaler>,
    processor: Arc<BatchProcessor>,
    batcher: RequestBatcher,
    database: Arc<dyn DatabaseExecutor>,
    generic: Arc<dyn GenericHandler>,
    probe: Arc<dyn HealthProbe>,
    sla: Arc<SlaTracker>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ProductionOptimizer {
    /// Build with the simulated collaborators
    pub fn new(config: OptimizerConfig) -> OptimizerResult<Self> {
        OptimizerBuilder::new(config).build()
    }

    pub fn builder(config: OptimizerConfig) -> OptimizerBuilder {
        OptimizerBuilder::new(config)
    }

    /// Bootstrap instance pools and spawn the background loops.
    ///
    /// Calling it again is a no-op. An optimizer that was shut down cannot be restarted.
    pub async fn start(&self) -> OptimizerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut bootstrapped = 0;
        for (model_type, model) in &self.config.batching.models {
            bootstrapped += self.scaler.ensure_instances(model_type, model.initial_instances).await?;
        }
        bootstrapped += self.scaler.ensure_min_instances().await?;

        let mut handles = vec![
            spawn_health_check_loop(
                self.balancer.clone(),
                self.probe.clone(),
                self.config.load_balancing.health_check_interval,
                self.shutdown.child_token(),
            ),
            self.scaler.clone().spawn_evaluation_loop(self.shutdown.child_token()),
            self.batcher.spawn_tick_loop(self.shutdown.child_token()),
        ];
        handles.extend(self.spawn_maintenance_loops());
        self.tasks.lock().extend(handles);

        info!(bootstrapped, "Production optimizer started");
        Ok(())
    }

    fn spawn_maintenance_loops(&self) -> Vec<JoinHandle<()>> {
        let maintenance = &self.config.maintenance;

        let cache = self.cache.clone();
        let stats_loop = spawn_periodic(
            "cache_stats",
            maintenance.cache_stats_interval,
            self.shutdown.child_token(),
            move || {
                let cache = cache.clone();
                async move {
                    let stats = cache.stats().await;
                    gauge!("cache_hit_ratio").set(stats.hit_ratio);
                    info!(
                        hits = stats.hits,
                        misses = stats.misses,
                        hit_ratio = stats.hit_ratio,
                        backend_errors = stats.backend_errors,
                        memory_entries = stats.memory.entries,
                        "Cache statistics"
                    );
                }
            },
        );

        let cache = self.cache.clone();
        let sweep_loop = spawn_periodic(
            "expired_sweep",
            maintenance.expired_sweep_interval,
            self.shutdown.child_token(),
            move || {
                let cache = cache.clone();
                async move {
                    let removed = cache.cleanup_expired();
                    if removed > 0 {
                        debug!(removed, "Swept expired cache entries");
                    }
                }
            },
        );

        let database = self.database.clone();
        let retention = maintenance.db_metrics_retention;
        let db_loop = spawn_periodic(
            "db_metrics_cleanup",
            maintenance.db_metrics_cleanup_interval,
            self.shutdown.child_token(),
            move || {
                let database = database.clone();
                async move {
                    let removed = database.cleanup_metrics(retention);
                    debug!(removed, "Database metrics cleanup complete");
                }
            },
        );

        vec![stats_loop, sweep_loop, db_loop]
    }

    /// Apply scaling and load-balancing changes from configuration reloads
    pub fn spawn_config_listener(&self, mut changes: broadcast::Receiver<ConfigChangeEvent>) {
        let scaler = self.scaler.clone();
        let balancer = self.balancer.clone();
        let shutdown = self.shutdown.child_token();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = changes.recv() => received,
                };

                match event {
                    Ok(event) => {
                        info!(file = %event.file_path.display(), "Applying configuration change");
                        if let Err(e) = scaler.update_config(event.config.scaling) {
                            warn!(error = %e, "Rejected scaling configuration");
                        }
                        balancer.set_algorithm(event.config.load_balancing.algorithm);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Configuration listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Configuration listener stopped");
        });

        self.tasks.lock().push(handle);
    }

    /// Run one request through cache, dispatch and SLA recording
    pub async fn process_request(&self, request: OptimizedRequest) -> ProcessResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let cache_type = request
            .cache_params
            .as_ref()
            .and_then(|_| self.config.routing.cache_types.get(&request.request_type))
            .cloned();

        if let (Some(cache_type), Some(params)) = (&cache_type, &request.cache_params) {
            match self.cache.get::<Value>(cache_type, params).await {
                Ok(Some(value)) => return self.finish(request_id, &request.request_type, started, Ok(value), true),
                Ok(None) => {}
                Err(e) => return self.finish(request_id, &request.request_type, started, Err(e), false),
            }
        }

        let result = self.dispatch(&request_id, &request).await;

        if let (Ok(value), Some(cache_type), Some(params)) = (&result, &cache_type, &request.cache_params) {
            if let Err(e) = self.cache.set(cache_type, value, params).await {
                warn!(request_id = %request_id, cache_type = %cache_type, error = %e, "Failed to cache result");
            }
        }

        self.finish(request_id, &request.request_type, started, result, false)
    }

    async fn dispatch(&self, request_id: &str, request: &OptimizedRequest) -> OptimizerResult<Value> {
        match request.request_type.as_str() {
            AI_MODEL_REQUEST => {
                let model_type = request
                    .model_type
                    .clone()
                    .or_else(|| request.payload.get("model").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| self.config.routing.default_model.clone());

                let mut batch_request = BatchRequest::new(model_type, request.payload.clone())
                    .with_request_id(request_id)
                    .with_priority(request.priority);
                if let Some(timeout) = request.timeout {
                    batch_request = batch_request.with_timeout(timeout);
                }
                self.batcher.submit(batch_request).await
            }
            DATABASE_REQUEST => {
                let query = request
                    .payload
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| OptimizerError::invalid_request("database request requires a 'query' string"))?;
                let params = request.payload.get("params").unwrap_or(&Value::Null);
                self.database.execute(query, params).await
            }
            other => self.generic.handle(other, &request.payload).await,
        }
    }

    fn finish(
        &self,
        request_id: String,
        request_type: &str,
        started: Instant,
        result: OptimizerResult<Value>,
        cached: bool,
    ) -> ProcessResponse {
        let response_time = started.elapsed();
        self.sla
            .record_request(request_type, response_time, result.is_ok(), cached);

        match result {
            Ok(data) => {
                debug!(request_id = %request_id, request_type, cached, ?response_time, "Request completed");
                ProcessResponse {
                    request_id,
                    success: true,
                    data: Some(data),
                    error: None,
                    cached,
                    response_time,
                }
            }
            Err(error) => {
                warn!(
                    request_id = %request_id,
                    request_type,
                    code = error.code(),
                    error = %error,
                    "Request failed"
                );
                ProcessResponse {
                    request_id,
                    success: false,
                    data: None,
                    error: Some(error),
                    cached,
                    response_time,
                }
            }
        }
    }

    /// Stop the background loops, flush the batcher and wait for every task
    pub async fn shutdown(&self) {
        info!("Shutting down production optimizer");
        self.shutdown.cancel();
        self.batcher.shutdown().await;
        self.scaler.shutdown();

        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Production optimizer stopped");
    }

    pub async fn status(&self) -> OptimizerStatus {
        OptimizerStatus {
            running: self.started.load(Ordering::SeqCst) && !self.shutdown.is_cancelled(),
            cache: self.cache.stats().await,
            cache_health: self.cache.health_check().await,
            load_balancer: self.balancer.stats(),
            batcher: self.batcher.stats(),
            processor: self.processor.stats(),
            sla: self.sla.snapshot(),
            scaling_events: self.scaler.scaling_history().len(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn auto_scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    pub fn batcher(&self) -> &RequestBatcher {
        &self.batcher
    }

    pub fn sla(&self) -> &Arc<SlaTracker> {
        &self.sla
    }
}

/// Run `task` every `every`, first after one full period
fn spawn_periodic<F, Fut>(name: &'static str, every: Duration, shutdown: CancellationToken, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => task().await,
            }
        }

        debug!(task = name, "Maintenance loop stopped");
    })
}
