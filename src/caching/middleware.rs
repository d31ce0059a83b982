//! # Cache Middleware
//!
//! Explicit wrappers that put a cache check in front of an async operation.
//! The operation runs only on a miss; a successful result is written back
//! and a failed write-back is logged, never returned.

use super::{CacheManager, CacheParams};
use crate::core::error::OptimizerResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::warn;

/// Result of a cache-wrapped call
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    /// Whether the value came from the cache
    pub hit: bool,
}

/// Run `op` unless `(cache_type, params)` is already cached.
///
/// Lookup errors other than an unknown cache type are absorbed by the
/// manager, so the only way this fails before `op` runs is a caller error.
pub async fn cached<T, F, Fut>(
    manager: &CacheManager,
    cache_type: &str,
    params: &CacheParams,
    op: F,
) -> OptimizerResult<Cached<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = OptimizerResult<T>>,
{
    if let Some(value) = manager.get::<T>(cache_type, params).await? {
        return Ok(Cached { value, hit: true });
    }

    let value = op().await?;

    if let Err(e) = manager.set(cache_type, &value, params).await {
        warn!(cache_type, error = %e, "Failed to cache computed value");
    }

    Ok(Cached { value, hit: false })
}

/// Like [`cached`], returning only the value
pub async fn get_or_compute<T, F, Fut>(
    manager: &CacheManager,
    cache_type: &str,
    params: &CacheParams,
    op: F,
) -> OptimizerResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = OptimizerResult<T>>,
{
    cached(manager, cache_type, params, op).await.map(|c| c.value)
}
