//! # Caching System Module
//!
//! Multi-level caching keyed by named cache types.
//!
//! ## Architecture
//! 1. **Key generation**: `CacheKey` derives `cache:<type>:<hash>` from a
//!    cache type and an order-independent parameter set
//! 2. **Stores**: an in-process LRU/TTL cache and a Redis-backed distributed cache,
//!    both behind the `CacheStore` trait
//! 3. **Cache Manager**: walks the configured levels per cache type, promotes
//!    hits into faster levels and handles tag-based invalidation
//! 4. **Middleware**: explicit `cached` / `get_or_compute` wrappers around an operation
//!
//! ## Usage Example
//! ```rust,ignore
//! use production_optimizer::caching::{CacheConfig, CacheManager, CacheKey};
//!
//! let manager = CacheManager::new(CacheConfig::default());
//! let params = CacheKey::params([("company", "acme")]);
//!
//! manager.set("financial_analysis", &serde_json::json!({"score": 85.5}), &params).await?;
//! let hit: Option<serde_json::Value> = manager.get("financial_analysis", &params).await?;
//! ```

pub mod cache_manager;
pub mod key_generator;
pub mod middleware;
pub mod stores;

pub use cache_manager::{CacheConfig, CacheLevel, CacheManager, CacheStats, CacheTypeConfig};
pub use key_generator::{CacheKey, CacheParams};
pub use middleware::{cached, get_or_compute};
pub use stores::{CacheEntry, CacheStore, CacheStoreStats, InMemoryCache, RedisCache, RedisCacheConfig};

use crate::core::error::OptimizerError;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache operation timeout")]
    Timeout,

    #[error("Cache not available")]
    Unavailable,
}

impl From<CacheError> for OptimizerError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Redis(e) => OptimizerError::CacheBackendUnavailable {
                backend: "redis".to_string(),
                reason: e.to_string(),
            },
            CacheError::Timeout => OptimizerError::CacheBackendUnavailable {
                backend: "distributed".to_string(),
                reason: "operation timed out".to_string(),
            },
            CacheError::Unavailable => OptimizerError::CacheBackendUnavailable {
                backend: "distributed".to_string(),
                reason: "not connected".to_string(),
            },
        }
    }
}
