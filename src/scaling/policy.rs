//! Scaling policies and decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Per service-type scaling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    /// Lower bound on non-stopping instances
    pub min_instances: usize,

    /// Upper bound on non-stopping instances
    pub max_instances: usize,

    /// Target CPU usage in percent
    pub target_cpu: f64,

    /// Target memory usage in percent
    pub target_memory: f64,

    /// Target response time
    #[serde(with = "humantime_serde")]
    pub target_response_time: Duration,

    /// Scale up when any average exceeds `target * scale_up_threshold`
    pub scale_up_threshold: f64,

    /// Scale down when every average is below `target * scale_down_threshold`
    pub scale_down_threshold: f64,

    /// Minimum time between two scale-ups
    #[serde(with = "humantime_serde")]
    pub scale_up_cooldown: Duration,

    /// Minimum time between two scale-downs
    #[serde(with = "humantime_serde")]
    pub scale_down_cooldown: Duration,

    /// Samples older than this are dropped from the averages
    #[serde(with = "humantime_serde")]
    pub metrics_window: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_instances: 2,
            max_instances: 10,
            target_cpu: 70.0,
            target_memory: 80.0,
            target_response_time: Duration::from_secs(1),
            scale_up_threshold: 1.0,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
            metrics_window: Duration::from_secs(300),
        }
    }
}

impl ScalingPolicy {
    /// Validate the policy, prefixing messages with `name`
    pub fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_instances == 0 {
            errors.push(format!("scaling policy '{}': max_instances must be at least 1", name));
        }
        if self.min_instances > self.max_instances {
            errors.push(format!(
                "scaling policy '{}': min_instances ({}) exceeds max_instances ({})",
                name, self.min_instances, self.max_instances
            ));
        }
        if !(0.0..=100.0).contains(&self.target_cpu) || self.target_cpu == 0.0 {
            errors.push(format!("scaling policy '{}': target_cpu must be in (0, 100]", name));
        }
        if !(0.0..=100.0).contains(&self.target_memory) || self.target_memory == 0.0 {
            errors.push(format!("scaling policy '{}': target_memory must be in (0, 100]", name));
        }
        if self.target_response_time.is_zero() {
            errors.push(format!("scaling policy '{}': target_response_time must be non-zero", name));
        }
        if !(self.scale_down_threshold > 0.0 && self.scale_down_threshold < self.scale_up_threshold) {
            errors.push(format!(
                "scaling policy '{}': need 0 < scale_down_threshold < scale_up_threshold",
                name
            ));
        }
        if self.metrics_window.is_zero() {
            errors.push(format!("scaling policy '{}': metrics_window must be non-zero", name));
        }

        errors
    }
}

/// Auto-scaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Interval of the evaluation loop
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,

    /// Simulated provisioning time before a new instance turns healthy
    #[serde(with = "humantime_serde")]
    pub startup_delay: Duration,

    /// Time a stopping instance keeps draining before removal
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Number of scaling events kept in memory
    pub history_limit: usize,

    /// Policies per service type; types without a policy are never scaled
    pub policies: HashMap<String, ScalingPolicy>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        let policies = [("llm-large", 2, 6), ("llm-fast", 2, 10), ("embedding", 2, 8)]
            .into_iter()
            .map(|(name, min_instances, max_instances)| {
                (
                    name.to_string(),
                    ScalingPolicy {
                        min_instances,
                        max_instances,
                        ..ScalingPolicy::default()
                    },
                )
            })
            .collect();

        Self {
            evaluation_interval: Duration::from_secs(30),
            startup_delay: Duration::from_secs(10),
            grace_period: Duration::from_secs(30),
            history_limit: 100,
            policies,
        }
    }
}

/// Averages a decision is based on
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalingMetrics {
    pub avg_cpu: f64,
    pub avg_memory: f64,
    /// Seconds
    pub avg_response_time: f64,
    pub samples: usize,
}

/// Decision made by the auto-scaling logic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScalingDecision {
    /// No action needed
    None,
    /// Provision one more instance
    ScaleUp { service_type: String, reason: String },
    /// Retire one instance
    ScaleDown { service_type: String, reason: String },
}

impl ScalingDecision {
    pub fn is_none(&self) -> bool {
        matches!(self, ScalingDecision::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
}

impl fmt::Display for ScalingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingDirection::Up => f.write_str("up"),
            ScalingDirection::Down => f.write_str("down"),
        }
    }
}

/// A scaling action that was taken
#[derive(Debug, Clone, Serialize)]
pub struct ScalingEvent {
    pub service_type: String,
    pub direction: ScalingDirection,
    pub instance_id: String,
    pub reason: String,
    /// Non-stopping instances before the action
    pub instances_before: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies_are_valid() {
        let config = ScalingConfig::default();
        for (name, policy) in &config.policies {
            assert!(policy.validate(name).is_empty(), "{} invalid", name);
        }
    }

    #[test]
    fn test_policy_validation() {
        let policy = ScalingPolicy {
            min_instances: 5,
            max_instances: 3,
            scale_down_threshold: 1.5,
            ..Default::default()
        };
        let errors = policy.validate("svc");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("min_instances"));
    }
}
