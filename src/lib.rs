//! # Production Optimizer
//!
//! Request optimization pipeline for analytics backends: multi-level caching,
//! load balancing with circuit breakers, auto-scaling of model instance pools
//! and priority-aware request batching, coordinated by one
//! [`ProductionOptimizer`].
//!
//! ## Request flow
//! 1. `ProductionOptimizer::process_request` checks the `CacheManager`
//! 2. on a miss, AI requests go to the `RequestBatcher`; database and generic
//!    requests run through pluggable handlers
//! 3. the batcher hands full or expired batches to the `BatchProcessor`, which
//!    borrows an instance from the `LoadBalancer` and reports the outcome back
//! 4. successful results are cached and every outcome is recorded for SLA tracking
//!
//! Every collaborator is constructed explicitly and injected, so tests can
//! swap in deterministic executors, probes and cache stores.

/// Error taxonomy, configuration, shared types and the circuit breaker
pub mod core;

/// Multi-level caching keyed by cache type
pub mod caching;

/// Instance pool, selection algorithms and health checking
pub mod load_balancing;

/// Policy-driven auto-scaling of instance pools
pub mod scaling;

/// Priority-aware request batching per model type
pub mod batching;

/// Composition root and request handlers
pub mod optimizer;

/// Logging, metrics and SLA tracking
pub mod observability;

pub use crate::core::config::{ConfigManager, OptimizerConfig};
pub use crate::core::error::{ErrorCategory, OptimizerError, OptimizerResult};
pub use crate::core::types::{HealthStatus, RequestPriority, ServiceInstance};
pub use caching::{CacheKey, CacheManager};
pub use load_balancing::LoadBalancer;
pub use optimizer::{OptimizedRequest, OptimizerBuilder, ProcessResponse, ProductionOptimizer};
pub use scaling::AutoScaler;
pub use batching::RequestBatcher;
