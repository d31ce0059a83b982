//! # Cache Stores Module
//!
//! Cache level implementations: a bounded in-process LRU cache and a
//! Redis-backed distributed cache. Both store opaque bytes; encoding is the
//! cache manager's concern.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryCache;
pub use redis_store::{RedisCache, RedisCacheConfig};

use super::CacheResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// One stored value with its lifetime bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Encoded value
    pub value: Vec<u8>,

    pub created_at: Instant,

    /// Absolute expiry
    pub expires_at: Instant,

    /// Reads served from this entry
    pub access_count: u64,

    /// Approximate footprint in bytes
    pub size: usize,
}

impl CacheEntry {
    /// Entry expiring `ttl` from now
    pub fn new(value: Vec<u8>, ttl: Duration) -> Self {
        let now = Instant::now();
        let size = value.len() + std::mem::size_of::<Self>();

        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
            size,
        }
    }

    /// Expiry is checked lazily on read and by the sweeper
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn mark_accessed(&mut self) {
        self.access_count += 1;
    }
}

/// One cache level. Keys are full `cache:<type>:<hash>` strings.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short name used in logs and stats (`memory`, `redis`, ...)
    fn name(&self) -> &str;

    /// `None` on a miss or an expired entry
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Insert or overwrite with an absolute expiry of now + `ttl`
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Returns whether the key was present
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Drop every entry of this level
    async fn clear(&self) -> CacheResult<()>;

    /// Delete every key matching a glob pattern (only a trailing `*` is
    /// required to be supported). Returns the number of deleted keys.
    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize>;

    async fn stats(&self) -> CacheResult<CacheStoreStats>;

    /// `Ok(false)` or an error both mean the level is unusable
    async fn health_check(&self) -> CacheResult<bool>;
}

/// Counters of one cache level
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStoreStats {
    pub entries: usize,

    /// Approximate bytes held
    pub memory_usage: usize,

    pub hits: u64,
    pub misses: u64,

    /// Capacity evictions
    pub evictions: u64,

    /// Entries dropped after expiring
    pub expired_cleanups: u64,

    /// Failed backend operations
    pub errors: u64,
}

impl CacheStoreStats {
    /// Hit ratio in [0, 1]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
