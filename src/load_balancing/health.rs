//! # Active Health Checking
//!
//! Periodically probes every registered instance and feeds the outcome back
//! into the load balancer. This runs independently of the circuit breakers,
//! which react to request outcomes only.
//!
//! Probes run without holding any balancer lock; the pool may change while a
//! pass is in flight and results for instances that disappeared are dropped.

use super::balancer::LoadBalancer;
use crate::core::types::{HealthStatus, ServiceInstance};
use async_trait::async_trait;
use metrics::counter;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of probing one instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// Health probe seam; a real deployment would call the instance's health endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &ServiceInstance) -> ProbeOutcome;
}

/// Random outcomes with a configurable failure rate
#[derive(Debug, Clone)]
pub struct SimulatedHealthProbe {
    /// Probability in [0, 1] that a probe fails
    pub failure_rate: f64,
    /// Reported CPU range in percent
    pub cpu_range: (f64, f64),
    /// Reported memory range in percent
    pub memory_range: (f64, f64),
}

impl Default for SimulatedHealthProbe {
    fn default() -> Self {
        Self {
            failure_rate: 0.02,
            cpu_range: (20.0, 80.0),
            memory_range: (30.0, 70.0),
        }
    }
}

fn sample(rng: &mut impl Rng, (low, high): (f64, f64)) -> f64 {
    if high > low {
        rng.gen_range(low..high)
    } else {
        low
    }
}

#[async_trait]
impl HealthProbe for SimulatedHealthProbe {
    async fn probe(&self, _instance: &ServiceInstance) -> ProbeOutcome {
        let mut rng = rand::thread_rng();
        ProbeOutcome {
            healthy: rng.gen::<f64>() >= self.failure_rate,
            cpu_usage: sample(&mut rng, self.cpu_range),
            memory_usage: sample(&mut rng, self.memory_range),
        }
    }
}

/// Always reports the same outcome
#[derive(Debug, Clone, Copy)]
pub struct StaticHealthProbe(pub ProbeOutcome);

impl StaticHealthProbe {
    pub fn healthy() -> Self {
        Self(ProbeOutcome {
            healthy: true,
            cpu_usage: 10.0,
            memory_usage: 10.0,
        })
    }

    pub fn unhealthy() -> Self {
        Self(ProbeOutcome {
            healthy: false,
            cpu_usage: 0.0,
            memory_usage: 0.0,
        })
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn probe(&self, _instance: &ServiceInstance) -> ProbeOutcome {
        self.0
    }
}

/// Probe every instance once. Returns the number of status transitions.
pub async fn run_health_checks(balancer: &LoadBalancer, probe: &dyn HealthProbe) -> usize {
    let mut transitions = 0;

    for instance_id in balancer.instance_ids() {
        let Some(instance) = balancer.instance(&instance_id) else {
            continue;
        };
        if instance.health_status == HealthStatus::Stopping {
            continue;
        }

        let outcome = probe.probe(&instance).await;
        counter!(
            "load_balancer_health_checks_total",
            "result" => if outcome.healthy { "pass" } else { "fail" }
        )
        .increment(1);

        if let Some((old, new)) =
            balancer.record_health_check(&instance_id, outcome.healthy, outcome.cpu_usage, outcome.memory_usage)
        {
            transitions += 1;
            if new == HealthStatus::Healthy {
                info!(instance_id = %instance_id, from = %old, "Instance recovered");
            } else {
                warn!(instance_id = %instance_id, from = %old, to = %new, "Instance failed health check");
            }
        }
    }

    transitions
}

/// Spawn the periodic health-check loop
pub fn spawn_health_check_loop(
    balancer: Arc<LoadBalancer>,
    probe: Arc<dyn HealthProbe>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let transitions = run_health_checks(&balancer, probe.as_ref()).await;
                    debug!(transitions, "Health check pass complete");
                }
            }
        }

        debug!("Health check loop stopped");
    })
}
