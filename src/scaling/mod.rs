//! # Auto-Scaling
//!
//! Policy-driven provisioning and retirement of service instances on top of
//! the load balancer's instance pool.

pub mod auto_scaler;
pub mod policy;

pub use auto_scaler::{AutoScaler, InstanceProvisioner, SimulatedProvisioner};
pub use policy::{ScalingConfig, ScalingDecision, ScalingDirection, ScalingEvent, ScalingMetrics, ScalingPolicy};
