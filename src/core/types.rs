//! # Core Types
//!
//! Shared data structures for service instances, request priorities and
//! selection context. Instance records are owned by the load balancer and
//! handed out as snapshots (clones); nothing outside the balancer mutates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::core::error::OptimizerError;

/// Service instance information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier
    pub instance_id: String,

    /// Service (or model) type this instance serves
    pub service_type: String,

    /// Instance host
    pub host: String,

    /// Instance port
    pub port: u16,

    /// Health status
    pub health_status: HealthStatus,

    /// CPU usage in percent (0-100)
    pub cpu_usage: f64,

    /// Memory usage in percent (0-100)
    pub memory_usage: f64,

    /// Response time in seconds (exponential moving average)
    pub response_time: f64,

    /// Error rate in [0, 1] (exponential moving average)
    pub error_rate: f64,

    /// Requests currently in flight on this instance
    pub active_connections: u64,

    /// Number of completed requests, used to seed the moving averages
    pub completed_requests: u64,

    /// Relative weight for the weighted algorithm
    pub weight: f64,

    /// Instance metadata
    pub metadata: HashMap<String, String>,

    /// Last health check timestamp
    pub last_health_check: Option<DateTime<Utc>>,

    /// When the instance record was created
    pub created_at: DateTime<Utc>,
}

impl ServiceInstance {
    /// Create a new service instance in the `Starting` state
    pub fn new(
        instance_id: impl Into<String>,
        service_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_type: service_type.into(),
            host: host.into(),
            port,
            health_status: HealthStatus::Starting,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            response_time: 0.0,
            error_rate: 0.0,
            active_connections: 0,
            completed_requests: 0,
            weight: 1.0,
            metadata: HashMap::new(),
            last_health_check: None,
            created_at: Utc::now(),
        }
    }

    /// Builder-style health status override
    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.health_status = status;
        self
    }

    /// Builder-style weight override
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Check if instance is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self.health_status, HealthStatus::Healthy)
    }

    /// Get instance endpoint
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Health status of a service instance
///
/// Lifecycle: `Starting -> Healthy <-> Unhealthy/Degraded -> Stopping`.
/// `Stopping` is terminal; the instance is removed after its grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Instance is healthy and ready to receive traffic
    Healthy,
    /// Instance is unhealthy and should not receive traffic
    Unhealthy,
    /// Instance answers but with reduced quality
    Degraded,
    /// Instance is being provisioned
    Starting,
    /// Instance is draining before removal
    Stopping,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Request priority levels (higher variant = drained first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    /// Background and bulk work
    Low = 0,
    /// Standard requests
    Normal = 1,
    /// Interactive requests
    High = 2,
    /// Fire immediately where the batching strategy allows it
    Critical = 3,
}

impl RequestPriority {
    /// Number of priority levels
    pub const COUNT: usize = 4;

    /// Order in which queues are drained when a batch is assembled
    pub const DRAIN_ORDER: [RequestPriority; 4] = [
        RequestPriority::Critical,
        RequestPriority::High,
        RequestPriority::Normal,
        RequestPriority::Low,
    ];

    /// Index of this priority's lane
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Normal
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPriority::Low => write!(f, "low"),
            RequestPriority::Normal => write!(f, "normal"),
            RequestPriority::High => write!(f, "high"),
            RequestPriority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for RequestPriority {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RequestPriority::Low),
            "normal" => Ok(RequestPriority::Normal),
            "high" => Ok(RequestPriority::High),
            "critical" => Ok(RequestPriority::Critical),
            other => Err(OptimizerError::config(format!("Unknown priority: {}", other))),
        }
    }
}

/// Caller-supplied context for instance selection
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// Affinity key (client IP, session id, ...) used by `ip_hash`
    pub affinity_key: Option<String>,
}

impl SelectionContext {
    /// Context carrying an affinity key
    pub fn with_affinity(key: impl Into<String>) -> Self {
        Self {
            affinity_key: Some(key.into()),
        }
    }
}
