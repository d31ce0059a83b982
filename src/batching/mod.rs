//! # Request Batching
//!
//! Priority-aware batching of model requests:
//!
//! - [`RequestBatcher`] queues requests per model and priority and decides
//!   when to flush
//! - [`BatchProcessor`] runs a flushed batch on an instance picked by the
//!   load balancer, bounded by a per-model concurrency limit
//! - [`ModelExecutor`] is the seam where a real inference service plugs in

pub mod batcher;
pub mod executor;
pub mod processor;
pub mod strategy;
pub mod types;

pub use batcher::{BatcherStats, ModelBatchStats, RequestBatcher};
pub use executor::{ModelExecutor, SimulatedModelExecutor};
pub use processor::{BatchProcessor, ProcessorModelStats};
pub use strategy::{FireReason, QueueSnapshot};
pub use types::{AdaptiveConfig, BatchItem, BatchRequest, BatchingConfig, BatchingStrategy, ItemOutcome, ModelConfig};
