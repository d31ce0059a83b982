//! # Optimizer
//!
//! The composition root tying caching, load balancing, scaling and batching
//! together, plus the seams for request types that bypass the batcher.

pub mod handlers;
pub mod production;

pub use handlers::{DatabaseExecutor, EchoHandler, GenericHandler, QueryMetrics, SimulatedDatabaseExecutor};
pub use production::{
    OptimizedRequest, OptimizerBuilder, OptimizerStatus, ProcessResponse, ProductionOptimizer, AI_MODEL_REQUEST,
    DATABASE_REQUEST,
};
