//! # Load Balancing
//!
//! Instance pool, selection algorithms, per-instance circuit breakers and
//! active health checking.

pub mod balancer;
pub mod health;
pub mod strategies;

pub use balancer::{LoadBalancer, LoadBalancerConfig, LoadBalancerStats};
pub use health::{HealthProbe, ProbeOutcome, SimulatedHealthProbe, StaticHealthProbe};
pub use strategies::{BalancingStrategy, LoadBalancingAlgorithm};
