//! # Auto-Scaler
//!
//! Grows and shrinks the load balancer's pools under per service-type
//! policies. Each evaluation records one sample of the healthy instances'
//! CPU, memory and response time; decisions use the averages of the samples
//! inside the policy's metrics window.
//!
//! At most one action fires per evaluation and scale-up is checked first.
//! Cooldown timestamps are set when an action is decided, before the
//! (simulated) provisioning finishes, so overlapping evaluations cannot
//! stack actions.

use super::policy::{
    ScalingConfig, ScalingDecision, ScalingDirection, ScalingEvent, ScalingMetrics, ScalingPolicy,
};
use crate::core::error::{OptimizerError, OptimizerResult};
use crate::core::types::{HealthStatus, ServiceInstance};
use crate::load_balancing::LoadBalancer;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Provisioning seam; a real deployment would call a cloud or orchestrator API
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    /// Create a new instance record for `service_type`
    async fn provision(&self, service_type: &str) -> OptimizerResult<ServiceInstance>;

    /// Release an instance that has been drained
    async fn decommission(&self, instance: &ServiceInstance) -> OptimizerResult<()>;
}

/// Hands out local host/port pairs
pub struct SimulatedProvisioner {
    host: String,
    next_port: AtomicU16,
    weight: f64,
}

impl SimulatedProvisioner {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            next_port: AtomicU16::new(base_port),
            weight: 1.0,
        }
    }

    /// Weight given to provisioned instances
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

impl Default for SimulatedProvisioner {
    fn default() -> Self {
        Self::new("127.0.0.1", 8100)
    }
}

#[async_trait]
impl InstanceProvisioner for SimulatedProvisioner {
    async fn provision(&self, service_type: &str) -> OptimizerResult<ServiceInstance> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let instance_id = format!("{}-{}", service_type, &suffix[..8]);

        Ok(ServiceInstance::new(instance_id, service_type, self.host.clone(), port).with_weight(self.weight))
    }

    async fn decommission(&self, instance: &ServiceInstance) -> OptimizerResult<()> {
        debug!(instance_id = %instance.instance_id, "Decommissioned simulated instance");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct MetricSample {
    at: Instant,
    cpu: f64,
    memory: f64,
    response_time: f64,
}

#[derive(Debug, Default)]
struct ServiceScalingState {
    samples: VecDeque<MetricSample>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

impl ServiceScalingState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

fn averages<'a>(samples: impl Iterator<Item = &'a MetricSample>) -> Option<ScalingMetrics> {
    let (mut cpu, mut memory, mut response_time, mut count) = (0.0, 0.0, 0.0, 0usize);
    for sample in samples {
        cpu += sample.cpu;
        memory += sample.memory;
        response_time += sample.response_time;
        count += 1;
    }
    (count > 0).then(|| ScalingMetrics {
        avg_cpu: cpu / count as f64,
        avg_memory: memory / count as f64,
        avg_response_time: response_time / count as f64,
        samples: count,
    })
}

/// Policy-driven pool sizing
pub struct AutoScaler {
    balancer: Arc<LoadBalancer>,
    provisioner: Arc<dyn InstanceProvisioner>,
    config: RwLock<ScalingConfig>,
    state: Mutex<HashMap<String, ServiceScalingState>>,
    history: Mutex<VecDeque<ScalingEvent>>,
    lifecycle: CancellationToken,
}

impl AutoScaler {
    pub fn new(config: ScalingConfig, balancer: Arc<LoadBalancer>, provisioner: Arc<dyn InstanceProvisioner>) -> Self {
        Self {
            balancer,
            provisioner,
            config: RwLock::new(config),
            state: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            lifecycle: CancellationToken::new(),
        }
    }

    /// Policy of a service type
    pub fn policy(&self, service_type: &str) -> Option<ScalingPolicy> {
        self.config.read().policies.get(service_type).cloned()
    }

    /// Service types with a policy, sorted
    pub fn service_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.config.read().policies.keys().cloned().collect();
        types.sort();
        types
    }

    /// Replace (or add) the policy of one service type
    pub fn update_policy(&self, service_type: &str, policy: ScalingPolicy) -> OptimizerResult<()> {
        let errors = policy.validate(service_type);
        if !errors.is_empty() {
            return Err(OptimizerError::config(errors.join("; ")));
        }

        let mut config = self.config.write();
        let changed = config.policies.get(service_type) != Some(&policy);
        config.policies.insert(service_type.to_string(), policy);
        if changed {
            info!(service_type = %service_type, "Scaling policy updated");
        }
        Ok(())
    }

    /// Apply a whole reloaded scaling section
    pub fn update_config(&self, new_config: ScalingConfig) -> OptimizerResult<()> {
        let errors: Vec<String> = new_config
            .policies
            .iter()
            .flat_map(|(name, policy)| policy.validate(name))
            .collect();
        if !errors.is_empty() {
            return Err(OptimizerError::config(errors.join("; ")));
        }

        *self.config.write() = new_config;
        info!("Scaling configuration reloaded");
        Ok(())
    }

    /// Scaling actions taken so far, oldest first
    pub fn scaling_history(&self) -> Vec<ScalingEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// Averages currently stored for a service type
    pub fn current_metrics(&self, service_type: &str) -> Option<ScalingMetrics> {
        self.state.lock().get(service_type).and_then(|s| averages(s.samples.iter()))
    }

    /// Decide without recording a sample or consuming a cooldown
    pub fn evaluate(&self, service_type: &str) -> ScalingDecision {
        self.decide(service_type, false)
    }

    /// Decide and carry out the decision
    pub async fn evaluate_and_scale(&self, service_type: &str) -> OptimizerResult<ScalingDecision> {
        let decision = self.decide(service_type, true);

        match &decision {
            ScalingDecision::None => {}
            ScalingDecision::ScaleUp { service_type, reason } => {
                self.scale_up(service_type, reason).await?;
            }
            ScalingDecision::ScaleDown { service_type, reason } => {
                self.scale_down(service_type, reason).await?;
            }
        }

        Ok(decision)
    }

    /// Bring every pool up to its policy's minimum with immediately healthy instances.
    ///
    /// Returns the number of instances created.
    pub async fn ensure_min_instances(&self) -> OptimizerResult<usize> {
        let mut created = 0;
        for service_type in self.service_types() {
            if let Some(policy) = self.policy(&service_type) {
                created += self.ensure_instances(&service_type, policy.min_instances).await?;
            }
        }
        Ok(created)
    }

    /// Provision healthy instances until `service_type` has `count` active ones
    pub async fn ensure_instances(&self, service_type: &str, count: usize) -> OptimizerResult<usize> {
        let mut created = 0;
        while self.active_count(service_type) < count {
            let instance = self.provisioner.provision(service_type).await?;
            info!(instance_id = %instance.instance_id, service_type = %service_type, "Bootstrapped instance");
            self.balancer.register_instance(instance.with_status(HealthStatus::Healthy));
            created += 1;
        }
        Ok(created)
    }

    /// Spawn the periodic evaluation loop
    pub fn spawn_evaluation_loop(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let every = self.config.read().evaluation_interval;

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for service_type in self.service_types() {
                            if let Err(e) = self.evaluate_and_scale(&service_type).await {
                                error!(service_type = %service_type, error = %e, "Scaling action failed");
                            }
                        }
                    }
                }
            }

            debug!("Auto-scaler loop stopped");
        })
    }

    /// Cancel pending startup and drain timers
    pub fn shutdown(&self) {
        self.lifecycle.cancel();
    }

    fn active_count(&self, service_type: &str) -> usize {
        self.balancer
            .instances(service_type)
            .iter()
            .filter(|i| i.health_status != HealthStatus::Stopping)
            .count()
    }

    fn decide(&self, service_type: &str, commit: bool) -> ScalingDecision {
        let Some(policy) = self.policy(service_type) else {
            return ScalingDecision::None;
        };

        let instances = self.balancer.instances(service_type);
        let active = instances
            .iter()
            .filter(|i| i.health_status != HealthStatus::Stopping)
            .count();
        let healthy: Vec<&ServiceInstance> = instances.iter().filter(|i| i.is_healthy()).collect();

        let now = Instant::now();
        let snapshot = (!healthy.is_empty()).then(|| {
            let n = healthy.len() as f64;
            MetricSample {
                at: now,
                cpu: healthy.iter().map(|i| i.cpu_usage).sum::<f64>() / n,
                memory: healthy.iter().map(|i| i.memory_usage).sum::<f64>() / n,
                response_time: healthy.iter().map(|i| i.response_time).sum::<f64>() / n,
            }
        });

        let mut states = self.state.lock();
        let state = states.entry(service_type.to_string()).or_default();
        state.prune(now, policy.metrics_window);
        if let (true, Some(sample)) = (commit, snapshot) {
            state.samples.push_back(sample);
        }

        let up = |reason: String| ScalingDecision::ScaleUp {
            service_type: service_type.to_string(),
            reason,
        };

        if active < policy.min_instances {
            if commit {
                state.last_scale_up = Some(now);
            }
            return up(format!("{} active instances, minimum is {}", active, policy.min_instances));
        }

        let extra = if commit { None } else { snapshot };
        let Some(metrics) = averages(state.samples.iter().chain(extra.iter())) else {
            return ScalingDecision::None;
        };

        let target_rt = policy.target_response_time.as_secs_f64();
        let mut pressure = Vec::new();
        if metrics.avg_cpu > policy.target_cpu * policy.scale_up_threshold {
            pressure.push(format!("cpu {:.1}% > {:.1}%", metrics.avg_cpu, policy.target_cpu));
        }
        if metrics.avg_memory > policy.target_memory * policy.scale_up_threshold {
            pressure.push(format!("memory {:.1}% > {:.1}%", metrics.avg_memory, policy.target_memory));
        }
        if metrics.avg_response_time > target_rt * policy.scale_up_threshold {
            pressure.push(format!("response time {:.3}s > {:.3}s", metrics.avg_response_time, target_rt));
        }

        if !pressure.is_empty() {
            if active >= policy.max_instances {
                self.refuse(service_type, format!("at max_instances ({})", policy.max_instances));
                return ScalingDecision::None;
            }
            if let Some(last) = state.last_scale_up {
                if now.saturating_duration_since(last) <= policy.scale_up_cooldown {
                    self.refuse(service_type, "scale-up cooldown active".to_string());
                    return ScalingDecision::None;
                }
            }
            if commit {
                state.last_scale_up = Some(now);
            }
            return up(pressure.join(", "));
        }

        let low = policy.scale_down_threshold;
        let idle = metrics.avg_cpu < policy.target_cpu * low
            && metrics.avg_memory < policy.target_memory * low
            && metrics.avg_response_time < target_rt * low;

        if idle {
            if active <= policy.min_instances {
                self.refuse(service_type, format!("at min_instances ({})", policy.min_instances));
                return ScalingDecision::None;
            }
            if let Some(last) = state.last_scale_down {
                if now.saturating_duration_since(last) <= policy.scale_down_cooldown {
                    self.refuse(service_type, "scale-down cooldown active".to_string());
                    return ScalingDecision::None;
                }
            }
            if commit {
                state.last_scale_down = Some(now);
            }
            return ScalingDecision::ScaleDown {
                service_type: service_type.to_string(),
                reason: format!(
                    "cpu {:.1}%, memory {:.1}%, response time {:.3}s below {:.0}% of targets",
                    metrics.avg_cpu,
                    metrics.avg_memory,
                    metrics.avg_response_time,
                    low * 100.0
                ),
            };
        }

        ScalingDecision::None
    }

    fn refuse(&self, service_type: &str, reason: String) {
        let violation = OptimizerError::ScalingPolicyViolation {
            service_type: service_type.to_string(),
            reason,
        };
        debug!(error = %violation, "Scaling action suppressed");
    }

    async fn scale_up(&self, service_type: &str, reason: &str) -> OptimizerResult<()> {
        let instances_before = self.active_count(service_type);
        let instance = self
            .provisioner
            .provision(service_type)
            .await?
            .with_status(HealthStatus::Starting);
        let instance_id = instance.instance_id.clone();
        self.balancer.register_instance(instance);

        let balancer = Arc::clone(&self.balancer);
        let startup_delay = self.config.read().startup_delay;
        let lifecycle = self.lifecycle.clone();
        let id = instance_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.cancelled() => {}
                _ = tokio::time::sleep(startup_delay) => {
                    let still_starting = balancer
                        .instance(&id)
                        .map(|i| i.health_status == HealthStatus::Starting)
                        .unwrap_or(false);
                    if still_starting {
                        balancer.set_health_status(&id, HealthStatus::Healthy);
                        info!(instance_id = %id, "Provisioned instance is healthy");
                    }
                }
            }
        });

        self.record_event(service_type, ScalingDirection::Up, instance_id, reason, instances_before);
        Ok(())
    }

    async fn scale_down(&self, service_type: &str, reason: &str) -> OptimizerResult<()> {
        let instances_before = self.active_count(service_type);
        let Some(victim) = self
            .balancer
            .instances(service_type)
            .into_iter()
            .filter(|i| i.is_healthy())
            .min_by_key(|i| i.active_connections)
        else {
            warn!(service_type = %service_type, "No healthy instance to retire");
            return Ok(());
        };

        let instance_id = victim.instance_id.clone();
        self.balancer.set_health_status(&instance_id, HealthStatus::Stopping);

        let balancer = Arc::clone(&self.balancer);
        let provisioner = Arc::clone(&self.provisioner);
        let grace = self.config.read().grace_period;
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Err(e) = provisioner.decommission(&victim).await {
                        warn!(instance_id = %victim.instance_id, error = %e, "Decommission failed");
                    }
                    balancer.unregister_instance(&victim.instance_id);
                }
            }
        });

        self.record_event(service_type, ScalingDirection::Down, instance_id, reason, instances_before);
        Ok(())
    }

    fn record_event(
        &self,
        service_type: &str,
        direction: ScalingDirection,
        instance_id: String,
        reason: &str,
        instances_before: usize,
    ) {
        info!(
            service_type = %service_type,
            direction = %direction,
            instance_id = %instance_id,
            instances_before,
            reason = %reason,
            "Scaling action"
        );
        counter!(
            "autoscaler_scale_events_total",
            "service_type" => service_type.to_string(),
            "direction" => direction.to_string()
        )
        .increment(1);

        let limit = self.config.read().history_limit.max(1);
        let mut history = self.history.lock();
        history.push_back(ScalingEvent {
            service_type: service_type.to_string(),
            direction,
            instance_id,
            reason: reason.to_string(),
            instances_before,
            timestamp: Utc::now(),
        });
        while history.len() > limit {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancing::LoadBalancerConfig;

    fn scaler_with(policy: ScalingPolicy) -> (Arc<AutoScaler>, Arc<LoadBalancer>) {
        let balancer = Arc::new(LoadBalancer::new(LoadBalancerConfig::default()));
        let config = ScalingConfig {
            policies: HashMap::from([("svc".to_string(), policy)]),
            startup_delay: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            ..Default::default()
        };
        let scaler = Arc::new(AutoScaler::new(
            config,
            balancer.clone(),
            Arc::new(SimulatedProvisioner::default()),
        ));
        (scaler, balancer)
    }

    fn add(balancer: &LoadBalancer, id: &str, cpu: f64) {
        let mut instance = ServiceInstance::new(id, "svc", "h", 1).with_status(HealthStatus::Healthy);
        instance.cpu_usage = cpu;
        instance.memory_usage = cpu;
        instance.response_time = 0.1;
        balancer.register_instance(instance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_min_instances() {
        let (scaler, balancer) = scaler_with(ScalingPolicy::default());
        assert_eq!(scaler.ensure_min_instances().await.unwrap(), 2);
        assert_eq!(balancer.healthy_count("svc"), 2);
        assert_eq!(scaler.ensure_min_instances().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_does_not_consume_cooldown() {
        let (scaler, balancer) = scaler_with(ScalingPolicy::default());
        add(&balancer, "a", 95.0);
        add(&balancer, "b", 95.0);

        for _ in 0..3 {
            assert!(matches!(scaler.evaluate("svc"), ScalingDecision::ScaleUp { .. }));
        }
        assert!(scaler.current_metrics("svc").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_turns_healthy_after_startup_delay() {
        let (scaler, balancer) = scaler_with(ScalingPolicy::default());
        add(&balancer, "a", 95.0);
        add(&balancer, "b", 95.0);

        let decision = scaler.evaluate_and_scale("svc").await.unwrap();
        assert!(matches!(decision, ScalingDecision::ScaleUp { .. }));
        assert_eq!(balancer.instances("svc").len(), 3);
        assert_eq!(balancer.healthy_count("svc"), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(balancer.healthy_count("svc"), 3);
        assert_eq!(scaler.scaling_history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_retires_least_busy_instance() {
        let (scaler, balancer) = scaler_with(ScalingPolicy::default());
        add(&balancer, "a", 5.0);
        add(&balancer, "b", 5.0);
        add(&balancer, "c", 5.0);
        balancer.record_request_start("a");
        balancer.record_request_start("c");

        let decision = scaler.evaluate_and_scale("svc").await.unwrap();
        assert!(matches!(decision, ScalingDecision::ScaleDown { .. }));
        assert_eq!(balancer.instance("b").unwrap().health_status, HealthStatus::Stopping);

        // Already at the minimum once b is stopping
        assert!(scaler.evaluate_and_scale("svc").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(balancer.instance("b").is_none());
        assert_eq!(balancer.instances("svc").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_instances_blocks_scale_up() {
        let (scaler, balancer) = scaler_with(ScalingPolicy {
            min_instances: 1,
            max_instances: 2,
            ..Default::default()
        });
        add(&balancer, "a", 99.0);
        add(&balancer, "b", 99.0);

        assert!(scaler.evaluate_and_scale("svc").await.unwrap().is_none());
        assert!(scaler.scaling_history().is_empty());
    }

    #[test]
    fn test_update_policy_validates() {
        let (scaler, _) = scaler_with(ScalingPolicy::default());
        let bad = ScalingPolicy {
            min_instances: 9,
            max_instances: 1,
            ..Default::default()
        };
        assert!(scaler.update_policy("svc", bad).is_err());
        assert!(scaler
            .update_policy("svc", ScalingPolicy { max_instances: 4, ..Default::default() })
            .is_ok());
        assert_eq!(scaler.policy("svc").unwrap().max_instances, 4);
    }
}
