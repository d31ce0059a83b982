//! # Load Balancer
//!
//! Owns the pool of service instances and one circuit breaker per instance.
//!
//! All instance state lives here and is changed only through this type's
//! methods: request start/end callbacks from the batch processor, health-check
//! results, and register/unregister calls from the auto-scaler. Callers get
//! clones, never references into the pool.
//!
//! Locks are taken in a fixed order (instances, then breakers) and are never
//! held across an `.await`.

use super::strategies::{BalancingStrategy, LoadBalancingAlgorithm};
use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
use crate::core::types::{HealthStatus, SelectionContext, ServiceInstance};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Smoothing factor for the response-time moving average
pub const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Step toward 1.0 applied to the error rate on a failed request
pub const ERROR_RATE_FAILURE_ALPHA: f64 = 0.1;

/// Decay toward 0.0 applied to the error rate on a successful request
pub const ERROR_RATE_SUCCESS_DECAY: f64 = 0.05;

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Active selection algorithm
    pub algorithm: LoadBalancingAlgorithm,

    /// Interval of the active health-check loop
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Per-instance circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,

    /// Weight given to instances created by the auto-scaler
    pub default_weight: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            health_check_interval: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
            default_weight: 1.0,
        }
    }
}

/// Per-instance selection statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStats {
    pub selections: u64,
    pub last_selected: Option<DateTime<Utc>>,
}

/// Instance record plus its breaker and selection counters
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance: ServiceInstance,
    pub circuit: Option<CircuitBreakerSnapshot>,
    pub stats: InstanceStats,
}

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: LoadBalancingAlgorithm,
    pub total_selections: u64,
    pub failed_selections: u64,
    pub open_circuits: usize,
    pub instances: Vec<InstanceSnapshot>,
}

/// Instance pool with pluggable selection
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    instances: RwLock<IndexMap<String, ServiceInstance>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    strategy: RwLock<Box<dyn BalancingStrategy>>,
    instance_stats: DashMap<String, InstanceStats>,
    total_selections: AtomicU64,
    failed_selections: AtomicU64,
}

impl LoadBalancer {
    /// Create an empty pool
    pub fn new(config: LoadBalancerConfig) -> Self {
        let strategy = config.algorithm.build();
        Self {
            config,
            instances: RwLock::new(IndexMap::new()),
            breakers: Mutex::new(HashMap::new()),
            strategy: RwLock::new(strategy),
            instance_stats: DashMap::new(),
            total_selections: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Add an instance (replacing one with the same id) with a fresh breaker
    pub fn register_instance(&self, instance: ServiceInstance) {
        let instance_id = instance.instance_id.clone();
        let service_type = instance.service_type.clone();
        {
            let mut instances = self.instances.write();
            let mut breakers = self.breakers.lock();
            instances.insert(instance_id.clone(), instance);
            breakers.insert(instance_id.clone(), CircuitBreaker::new(self.config.circuit_breaker.clone()));
        }

        info!(instance_id = %instance_id, service_type = %service_type, "Registered service instance");
        self.publish_pool_gauge(&service_type);
    }

    /// Remove an instance and its breaker state
    pub fn unregister_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        let removed = {
            let mut instances = self.instances.write();
            let mut breakers = self.breakers.lock();
            breakers.remove(instance_id);
            instances.shift_remove(instance_id)
        };
        self.instance_stats.remove(instance_id);

        if let Some(instance) = &removed {
            info!(instance_id = %instance_id, service_type = %instance.service_type, "Unregistered service instance");
            self.publish_pool_gauge(&instance.service_type);
        }
        removed
    }

    /// Pick a healthy, circuit-closed instance of `service_type`.
    ///
    /// Returns `None` when no such instance exists; callers treat that as
    /// "no capacity" and do not retry here.
    pub fn select_instance(&self, service_type: &str, context: Option<&SelectionContext>) -> Option<ServiceInstance> {
        let candidates: Vec<ServiceInstance> = {
            let instances = self.instances.read();
            let mut breakers = self.breakers.lock();
            instances
                .values()
                .filter(|i| i.service_type == service_type && i.is_healthy())
                .filter(|i| {
                    breakers
                        .get_mut(&i.instance_id)
                        .map(|breaker| breaker.allows_request())
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };

        let strategy = self.strategy.read();
        let selected = strategy
            .select(service_type, &candidates, context)
            .and_then(|index| candidates.into_iter().nth(index));

        match &selected {
            Some(instance) => {
                self.total_selections.fetch_add(1, Ordering::Relaxed);
                let mut stats = self.instance_stats.entry(instance.instance_id.clone()).or_default();
                stats.selections += 1;
                stats.last_selected = Some(Utc::now());

                counter!(
                    "load_balancer_selections_total",
                    "service_type" => service_type.to_string(),
                    "algorithm" => strategy.algorithm().as_str()
                )
                .increment(1);
                debug!(
                    instance_id = %instance.instance_id,
                    service_type = %service_type,
                    algorithm = %strategy.algorithm(),
                    "Selected instance"
                );
            }
            None => {
                self.failed_selections.fetch_add(1, Ordering::Relaxed);
                counter!("load_balancer_failed_selections_total", "service_type" => service_type.to_string()).increment(1);
                debug!(service_type = %service_type, "No selectable instance");
            }
        }

        selected
    }

    /// Count a request as in flight on the instance
    pub fn record_request_start(&self, instance_id: &str) -> bool {
        let mut instances = self.instances.write();
        match instances.get_mut(instance_id) {
            Some(instance) => {
                instance.active_connections += 1;
                true
            }
            None => false,
        }
    }

    /// Fold a finished request into the instance's moving averages and breaker
    pub fn record_request_end(&self, instance_id: &str, success: bool, response_time: Duration) {
        let mut instances = self.instances.write();
        let Some(instance) = instances.get_mut(instance_id) else {
            debug!(instance_id = %instance_id, "Request finished on an instance that is gone");
            return;
        };

        instance.active_connections = instance.active_connections.saturating_sub(1);

        let sample = response_time.as_secs_f64();
        instance.response_time = if instance.completed_requests == 0 {
            sample
        } else {
            instance.response_time * (1.0 - RESPONSE_TIME_ALPHA) + sample * RESPONSE_TIME_ALPHA
        };
        instance.completed_requests += 1;

        instance.error_rate = if success {
            instance.error_rate * (1.0 - ERROR_RATE_SUCCESS_DECAY)
        } else {
            instance.error_rate * (1.0 - ERROR_RATE_FAILURE_ALPHA) + ERROR_RATE_FAILURE_ALPHA
        };

        let service_type = instance.service_type.clone();
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(instance_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.circuit_breaker.clone()));

        if success {
            breaker.record_success();
        } else if breaker.record_failure() {
            counter!("load_balancer_circuit_opened_total", "service_type" => service_type.clone()).increment(1);
            warn!(
                instance_id = %instance_id,
                service_type = %service_type,
                failures = breaker.consecutive_failures(),
                "Circuit breaker opened"
            );
        }
    }

    /// Apply an active health-probe result.
    ///
    /// Healthy/degraded instances that fail become unhealthy; unhealthy or
    /// degraded instances that pass become healthy. Starting and stopping
    /// instances only get their resource figures refreshed. Returns the
    /// `(old, new)` status when it changed.
    pub fn record_health_check(
        &self,
        instance_id: &str,
        healthy: bool,
        cpu_usage: f64,
        memory_usage: f64,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let mut instances = self.instances.write();
        let instance = instances.get_mut(instance_id)?;

        instance.cpu_usage = cpu_usage;
        instance.memory_usage = memory_usage;
        instance.last_health_check = Some(Utc::now());

        let old = instance.health_status;
        let new = match (old, healthy) {
            (HealthStatus::Unhealthy | HealthStatus::Degraded, true) => HealthStatus::Healthy,
            (HealthStatus::Healthy | HealthStatus::Degraded, false) => HealthStatus::Unhealthy,
            (status, _) => status,
        };

        if new == old {
            return None;
        }
        instance.health_status = new;
        Some((old, new))
    }

    /// Force a health status (scaler lifecycle transitions, operators)
    pub fn set_health_status(&self, instance_id: &str, status: HealthStatus) -> bool {
        let mut instances = self.instances.write();
        match instances.get_mut(instance_id) {
            Some(instance) => {
                debug!(instance_id = %instance_id, from = %instance.health_status, to = %status, "Health status changed");
                instance.health_status = status;
                true
            }
            None => false,
        }
    }

    /// Update CPU and memory figures reported by a metrics source
    pub fn update_resource_usage(&self, instance_id: &str, cpu_usage: f64, memory_usage: f64) -> bool {
        let mut instances = self.instances.write();
        match instances.get_mut(instance_id) {
            Some(instance) => {
                instance.cpu_usage = cpu_usage.clamp(0.0, 100.0);
                instance.memory_usage = memory_usage.clamp(0.0, 100.0);
                true
            }
            None => false,
        }
    }

    /// Switch the selection algorithm at runtime
    pub fn set_algorithm(&self, algorithm: LoadBalancingAlgorithm) {
        let mut strategy = self.strategy.write();
        if strategy.algorithm() != algorithm {
            *strategy = algorithm.build();
            counter!("load_balancer_algorithm_switches_total").increment(1);
            info!(algorithm = %algorithm, "Switched load balancing algorithm");
        }
    }

    /// Current algorithm
    pub fn algorithm(&self) -> LoadBalancingAlgorithm {
        self.strategy.read().algorithm()
    }

    /// Snapshot of one instance
    pub fn instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.instances.read().get(instance_id).cloned()
    }

    /// Snapshot of every instance of a service type, in registration order
    pub fn instances(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.instances
            .read()
            .values()
            .filter(|i| i.service_type == service_type)
            .cloned()
            .collect()
    }

    /// Number of healthy instances of a service type
    pub fn healthy_count(&self, service_type: &str) -> usize {
        self.instances
            .read()
            .values()
            .filter(|i| i.service_type == service_type && i.is_healthy())
            .count()
    }

    /// Ids of every registered instance
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.read().keys().cloned().collect()
    }

    /// Distinct service types with at least one instance
    pub fn service_types(&self) -> Vec<String> {
        self.instances
            .read()
            .values()
            .map(|i| i.service_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Breaker state of an instance
    pub fn circuit_state(&self, instance_id: &str) -> Option<CircuitState> {
        self.breakers.lock().get(instance_id).map(|b| b.state())
    }

    /// Get current statistics
    pub fn stats(&self) -> LoadBalancerStats {
        let instances = self.instances.read();
        let breakers = self.breakers.lock();

        let snapshots: Vec<InstanceSnapshot> = instances
            .values()
            .map(|instance| InstanceSnapshot {
                instance: instance.clone(),
                circuit: breakers.get(&instance.instance_id).map(|b| b.snapshot()),
                stats: self
                    .instance_stats
                    .get(&instance.instance_id)
                    .map(|s| s.value().clone())
                    .unwrap_or_default(),
            })
            .collect();

        LoadBalancerStats {
            algorithm: self.strategy.read().algorithm(),
            total_selections: self.total_selections.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            open_circuits: breakers.values().filter(|b| b.state() == CircuitState::Open).count(),
            instances: snapshots,
        }
    }

    fn publish_pool_gauge(&self, service_type: &str) {
        let count = self.instances(service_type).len();
        gauge!("load_balancer_instances", "service_type" => service_type.to_string()).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy(id: &str, service_type: &str) -> ServiceInstance {
        ServiceInstance::new(id, service_type, "127.0.0.1", 9000).with_status(HealthStatus::Healthy)
    }

    fn balancer() -> LoadBalancer {
        LoadBalancer::new(LoadBalancerConfig::default())
    }

    #[test]
    fn test_only_healthy_instances_are_selected() {
        let lb = balancer();
        lb.register_instance(healthy("a", "svc"));
        lb.register_instance(ServiceInstance::new("b", "svc", "127.0.0.1", 9001));

        for _ in 0..5 {
            assert_eq!(lb.select_instance("svc", None).unwrap().instance_id, "a");
        }
        assert!(lb.select_instance("other", None).is_none());
        assert_eq!(lb.stats().failed_selections, 1);
    }

    #[test]
    fn test_moving_averages() {
        let lb = balancer();
        lb.register_instance(healthy("a", "svc"));

        assert!(lb.record_request_start("a"));
        assert_eq!(lb.instance("a").unwrap().active_connections, 1);

        lb.record_request_end("a", true, Duration::from_millis(1000));
        let instance = lb.instance("a").unwrap();
        assert_eq!(instance.active_connections, 0);
        assert!((instance.response_time - 1.0).abs() < 1e-9);

        lb.record_request_end("a", false, Duration::from_millis(2000));
        let instance = lb.instance("a").unwrap();
        assert!((instance.response_time - 1.1).abs() < 1e-9);
        assert!((instance.error_rate - 0.1).abs() < 1e-9);
        // Floor at zero
        assert_eq!(instance.active_connections, 0);

        lb.record_request_end("a", true, Duration::from_millis(1100));
        assert!((lb.instance("a").unwrap().error_rate - 0.095).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_excludes_and_recovers() {
        let lb = balancer();
        lb.register_instance(healthy("a", "svc"));
        lb.register_instance(healthy("b", "svc"));

        for _ in 0..3 {
            lb.record_request_end("a", false, Duration::from_millis(10));
        }
        assert_eq!(lb.circuit_state("a"), Some(CircuitState::Open));

        for _ in 0..6 {
            assert_eq!(lb.select_instance("svc", None).unwrap().instance_id, "b");
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        let picked: BTreeSet<String> = (0..4)
            .filter_map(|_| lb.select_instance("svc", None))
            .map(|i| i.instance_id)
            .collect();
        assert!(picked.contains("a"));
    }

    #[test]
    fn test_unregister_clears_breaker() {
        let lb = balancer();
        lb.register_instance(healthy("a", "svc"));
        for _ in 0..3 {
            lb.record_request_end("a", false, Duration::from_millis(10));
        }

        assert!(lb.unregister_instance("a").is_some());
        assert_eq!(lb.circuit_state("a"), None);
        assert!(lb.select_instance("svc", None).is_none());

        lb.register_instance(healthy("a", "svc"));
        assert_eq!(lb.circuit_state("a"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_health_check_transitions() {
        let lb = balancer();
        lb.register_instance(healthy("a", "svc"));
        lb.register_instance(ServiceInstance::new("s", "svc", "127.0.0.1", 9001));

        assert_eq!(
            lb.record_health_check("a", false, 10.0, 20.0),
            Some((HealthStatus::Healthy, HealthStatus::Unhealthy))
        );
        assert_eq!(lb.record_health_check("a", false, 10.0, 20.0), None);
        assert_eq!(
            lb.record_health_check("a", true, 10.0, 20.0),
            Some((HealthStatus::Unhealthy, HealthStatus::Healthy))
        );
        // Starting instances are left to the scaler
        assert_eq!(lb.record_health_check("s", true, 10.0, 20.0), None);
        assert_eq!(lb.instance("s").unwrap().health_status, HealthStatus::Starting);
        assert!(lb.instance("a").unwrap().last_health_check.is_some());
    }

    #[test]
    fn test_switch_algorithm() {
        let lb = balancer();
        let mut busy = healthy("a", "svc");
        busy.active_connections = 5;
        lb.register_instance(busy);
        lb.register_instance(healthy("b", "svc"));

        lb.set_algorithm(LoadBalancingAlgorithm::LeastConnections);
        assert_eq!(lb.algorithm(), LoadBalancingAlgorithm::LeastConnections);
        assert_eq!(lb.select_instance("svc", None).unwrap().instance_id, "b");
    }
}
