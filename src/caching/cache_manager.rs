//! # Cache Manager
//!
//! Coordinates the cache levels configured per cache type.
//!
//! Every cache type names an ordered list of levels, fastest first. A read
//! walks that list; a hit at level *k* is copied into every level before *k*
//! with the type's TTL. Writes go to every level. The distributed level is
//! optional and every call to it is bounded by `operation_timeout`; failures
//! and timeouts are logged, counted and treated as a miss or a no-op so the
//! caller never sees them.
//!
//! The memory level is partitioned per cache type so that each type gets its
//! own capacity and tag invalidation can drop one type without touching others.

use super::key_generator::{CacheKey, CacheParams};
use super::stores::memory::DEFAULT_MAX_ENTRIES;
use super::{CacheError, CacheStore, CacheStoreStats, InMemoryCache, RedisCache, RedisCacheConfig};
use crate::core::error::{OptimizerError, OptimizerResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity of a memory partition when the cache type does not set one
    pub memory_max_entries: usize,

    /// Distributed level configuration
    pub redis: RedisCacheConfig,

    /// Static cache-type table
    pub cache_types: HashMap<String, CacheTypeConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let hour = 3600;
        let cache_types = [
            ("financial_analysis", hour, &["financial", "analysis"][..]),
            ("compliance_check", 2 * hour, &["compliance", "regulatory"][..]),
            ("market_intelligence", hour / 4, &["market", "intelligence"][..]),
            ("ai_responses", hour / 2, &["ai", "llm"][..]),
            ("database_queries", hour / 12, &["database"][..]),
            ("user_sessions", 24 * hour, &["session", "user"][..]),
        ]
        .into_iter()
        .map(|(name, ttl_secs, tags)| {
            (
                name.to_string(),
                CacheTypeConfig {
                    ttl: Duration::from_secs(ttl_secs),
                    max_entries: None,
                    levels: vec![CacheLevel::Memory, CacheLevel::Distributed],
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                },
            )
        })
        .collect();

        Self {
            memory_max_entries: DEFAULT_MAX_ENTRIES,
            redis: RedisCacheConfig::default(),
            cache_types,
        }
    }
}

impl CacheConfig {
    /// Validate the cache-type table
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.memory_max_entries == 0 {
            errors.push("cache.memory_max_entries must be greater than 0".to_string());
        }
        if self.cache_types.is_empty() {
            errors.push("cache.cache_types must define at least one cache type".to_string());
        }

        for (name, type_config) in &self.cache_types {
            if type_config.levels.is_empty() {
                errors.push(format!("cache type '{}' must use at least one level", name));
            }
            if type_config.ttl.is_zero() {
                errors.push(format!("cache type '{}' must have a non-zero ttl", name));
            }
            if type_config.max_entries == Some(0) {
                errors.push(format!("cache type '{}' has max_entries = 0", name));
            }
            let unique: HashSet<_> = type_config.levels.iter().collect();
            if unique.len() != type_config.levels.len() {
                errors.push(format!("cache type '{}' lists a level twice", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Per cache-type configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTypeConfig {
    /// Time to live of every entry of this type
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Memory partition capacity, falls back to `memory_max_entries`
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Levels to use, fastest first
    pub levels: Vec<CacheLevel>,

    /// Invalidation tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Cache level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    /// In-process cache (L1)
    Memory,
    /// Network-backed cache (L2)
    Distributed,
}

impl CacheLevel {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::Memory => "memory",
            CacheLevel::Distributed => "distributed",
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,

    /// Total cache misses
    pub misses: u64,

    /// Cache hit ratio
    pub hit_ratio: f64,

    /// Hits served by the memory level
    pub memory_hits: u64,

    /// Hits served by the distributed level
    pub distributed_hits: u64,

    /// Successful writes through `set`
    pub sets: u64,

    /// Absorbed distributed-level failures and timeouts
    pub backend_errors: u64,

    /// Memory level, summed over partitions
    pub memory: CacheStoreStats,

    /// Memory level per cache type
    pub partitions: BTreeMap<String, CacheStoreStats>,

    /// Distributed level, when configured and reachable
    pub distributed: Option<CacheStoreStats>,
}

/// Health of each level
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub memory: bool,
    /// `None` when no distributed level is configured
    pub distributed: Option<bool>,
}

impl CacheHealth {
    /// Memory healthy and distributed healthy or absent
    pub fn is_healthy(&self) -> bool {
        self.memory && self.distributed.unwrap_or(true)
    }
}

/// Multi-level cache manager
pub struct CacheManager {
    /// Configuration
    config: CacheConfig,

    /// Memory level, one partition per cache type
    memory: HashMap<String, Arc<InMemoryCache>>,

    /// Distributed level
    distributed: Option<Arc<dyn CacheStore>>,

    /// Bound on each distributed-level call
    operation_timeout: Duration,

    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    distributed_hits: AtomicU64,
    sets: AtomicU64,
    backend_errors: AtomicU64,
}

impl CacheManager {
    /// Create a cache manager; the Redis level is created when enabled
    pub fn new(config: CacheConfig) -> Self {
        let distributed: Option<Arc<dyn CacheStore>> = if config.redis.enabled {
            info!("Distributed cache level enabled");
            Some(Arc::new(RedisCache::new(config.redis.clone())))
        } else {
            None
        };
        Self::with_distributed(config, distributed)
    }

    /// Create a cache manager with an explicit distributed level
    pub fn with_distributed(config: CacheConfig, distributed: Option<Arc<dyn CacheStore>>) -> Self {
        let memory = config
            .cache_types
            .iter()
            .map(|(name, type_config)| {
                let capacity = type_config.max_entries.unwrap_or(config.memory_max_entries);
                (name.clone(), Arc::new(InMemoryCache::new(capacity)))
            })
            .collect();

        info!(
            cache_types = config.cache_types.len(),
            distributed = distributed.is_some(),
            "Cache manager initialized"
        );

        Self {
            operation_timeout: config.redis.operation_timeout,
            config,
            memory,
            distributed,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            distributed_hits: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Get cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Configuration of one cache type
    pub fn type_config(&self, cache_type: &str) -> OptimizerResult<&CacheTypeConfig> {
        self.config
            .cache_types
            .get(cache_type)
            .ok_or_else(|| OptimizerError::UnknownCacheType {
                cache_type: cache_type.to_string(),
            })
    }

    /// Get a value, promoting it into faster levels on a lower-level hit
    pub async fn get<T: DeserializeOwned>(&self, cache_type: &str, params: &CacheParams) -> OptimizerResult<Option<T>> {
        let type_config = self.type_config(cache_type)?;
        let key = CacheKey::derive(cache_type, params);

        for (position, level) in type_config.levels.iter().enumerate() {
            let Some(bytes) = self.level_get(cache_type, *level, key.as_str()).await else {
                continue;
            };

            let value = match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key = %key, level = %level, "Discarding undecodable cache entry: {}", e);
                    continue;
                }
            };

            for faster in &type_config.levels[..position] {
                self.level_set(cache_type, *faster, key.as_str(), &bytes, type_config.ttl).await;
            }

            self.hits.fetch_add(1, Ordering::Relaxed);
            match level {
                CacheLevel::Memory => self.memory_hits.fetch_add(1, Ordering::Relaxed),
                CacheLevel::Distributed => self.distributed_hits.fetch_add(1, Ordering::Relaxed),
            };
            metrics::counter!("optimizer_cache_hits_total", "cache_type" => cache_type.to_string(), "level" => level.as_str())
                .increment(1);
            debug!(key = %key, level = %level, "Cache hit");
            return Ok(Some(value));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("optimizer_cache_misses_total", "cache_type" => cache_type.to_string()).increment(1);
        debug!(key = %key, "Cache miss");
        Ok(None)
    }

    /// Write a value to every level of its cache type
    pub async fn set<T: Serialize + ?Sized>(&self, cache_type: &str, value: &T, params: &CacheParams) -> OptimizerResult<()> {
        let type_config = self.type_config(cache_type)?;
        let key = CacheKey::derive(cache_type, params);
        let bytes = serde_json::to_vec(value)?;

        for level in &type_config.levels {
            self.level_set(cache_type, *level, key.as_str(), &bytes, type_config.ttl).await;
        }

        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl = ?type_config.ttl, "Cached value");
        Ok(())
    }

    /// Whether any level holds the key
    pub async fn exists(&self, cache_type: &str, params: &CacheParams) -> OptimizerResult<bool> {
        let type_config = self.type_config(cache_type)?;
        let key = CacheKey::derive(cache_type, params);

        for level in &type_config.levels {
            let found = match level {
                CacheLevel::Memory => match self.memory.get(cache_type) {
                    Some(partition) => partition.exists(key.as_str()).await.unwrap_or(false),
                    None => false,
                },
                CacheLevel::Distributed => match &self.distributed {
                    Some(store) => self
                        .bounded(store.as_ref(), "exists", key.as_str(), store.exists(key.as_str()))
                        .await
                        .unwrap_or(false),
                    None => false,
                },
            };
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete a key from every level of its cache type
    pub async fn invalidate(&self, cache_type: &str, params: &CacheParams) -> OptimizerResult<bool> {
        let type_config = self.type_config(cache_type)?;
        let key = CacheKey::derive(cache_type, params);
        let mut deleted = false;

        for level in &type_config.levels {
            match level {
                CacheLevel::Memory => {
                    if let Some(partition) = self.memory.get(cache_type) {
                        deleted |= partition.delete(key.as_str()).await.unwrap_or(false);
                    }
                }
                CacheLevel::Distributed => {
                    if let Some(store) = &self.distributed {
                        deleted |= self
                            .bounded(store.as_ref(), "delete", key.as_str(), store.delete(key.as_str()))
                            .await
                            .unwrap_or(false);
                    }
                }
            }
        }

        debug!(key = %key, deleted, "Invalidated cache key");
        Ok(deleted)
    }

    /// Drop every entry of every cache type whose tags intersect `tags`.
    ///
    /// Returns the names of the invalidated cache types.
    pub async fn invalidate_by_tags<I, S>(&self, tags: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: HashSet<String> = tags.into_iter().map(|t| t.as_ref().to_string()).collect();
        let mut matched: Vec<String> = self
            .config
            .cache_types
            .iter()
            .filter(|(_, type_config)| type_config.tags.iter().any(|t| tags.contains(t)))
            .map(|(name, _)| name.clone())
            .collect();
        matched.sort();

        for cache_type in &matched {
            if let Some(partition) = self.memory.get(cache_type) {
                let _ = partition.clear().await;
            }

            let uses_distributed = self
                .config
                .cache_types
                .get(cache_type)
                .map(|c| c.levels.contains(&CacheLevel::Distributed))
                .unwrap_or(false);
            if let (true, Some(store)) = (uses_distributed, &self.distributed) {
                let pattern = CacheKey::pattern_for(cache_type);
                if let Some(removed) = self
                    .bounded(store.as_ref(), "delete_by_pattern", &pattern, store.delete_by_pattern(&pattern))
                    .await
                {
                    debug!(cache_type = %cache_type, removed, "Removed distributed entries");
                }
            }
        }

        info!(tags = ?tags, cache_types = ?matched, "Invalidated cache types by tag");
        matched
    }

    /// Wipe every level
    pub async fn clear_all(&self) {
        for partition in self.memory.values() {
            let _ = partition.clear().await;
        }
        if let Some(store) = &self.distributed {
            self.bounded(store.as_ref(), "clear", "*", store.clear()).await;
        }
        info!("All cache levels cleared");
    }

    /// Sweep expired entries out of the memory level
    pub fn cleanup_expired(&self) -> usize {
        self.memory.values().map(|partition| partition.cleanup_expired()).sum()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let mut memory = CacheStoreStats::default();
        let mut partitions = BTreeMap::new();

        for (name, partition) in &self.memory {
            if let Ok(stats) = partition.stats().await {
                memory.entries += stats.entries;
                memory.memory_usage += stats.memory_usage;
                memory.hits += stats.hits;
                memory.misses += stats.misses;
                memory.evictions += stats.evictions;
                memory.expired_cleanups += stats.expired_cleanups;
                partitions.insert(name.clone(), stats);
            }
        }

        let distributed = match &self.distributed {
            Some(store) => self.bounded(store.as_ref(), "stats", "*", store.stats()).await,
            None => None,
        };

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            distributed_hits: self.distributed_hits.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            memory,
            partitions,
            distributed,
        }
    }

    /// Check every level
    pub async fn health_check(&self) -> CacheHealth {
        let mut memory = true;
        for partition in self.memory.values() {
            memory &= partition.health_check().await.unwrap_or(false);
        }

        let distributed = match &self.distributed {
            Some(store) => Some(
                self.bounded(store.as_ref(), "health_check", "-", store.health_check())
                    .await
                    .unwrap_or(false),
            ),
            None => None,
        };

        if !memory {
            warn!("Memory cache health check failed");
        }
        if distributed == Some(false) {
            warn!("Distributed cache health check failed");
        }

        CacheHealth { memory, distributed }
    }

    async fn level_get(&self, cache_type: &str, level: CacheLevel, key: &str) -> Option<Vec<u8>> {
        match level {
            CacheLevel::Memory => self.memory.get(cache_type)?.get(key).await.ok().flatten(),
            CacheLevel::Distributed => {
                let store = self.distributed.as_ref()?;
                self.bounded(store.as_ref(), "get", key, store.get(key)).await.flatten()
            }
        }
    }

    async fn level_set(&self, cache_type: &str, level: CacheLevel, key: &str, bytes: &[u8], ttl: Duration) {
        match level {
            CacheLevel::Memory => {
                if let Some(partition) = self.memory.get(cache_type) {
                    let _ = partition.set(key, bytes, ttl).await;
                }
            }
            CacheLevel::Distributed => {
                if let Some(store) = &self.distributed {
                    self.bounded(store.as_ref(), "set", key, store.set(key, bytes, ttl)).await;
                }
            }
        }
    }

    /// Run a distributed-level call under the operation timeout, absorbing failures
    async fn bounded<T, F>(&self, store: &dyn CacheStore, operation: &str, key: &str, call: F) -> Option<T>
    where
        F: std::future::Future<Output = Result<T, CacheError>>,
    {
        let outcome = match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e,
            Err(_) => CacheError::Timeout,
        };

        self.backend_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("optimizer_cache_backend_errors_total", "operation" => operation.to_string()).increment(1);

        let error = match OptimizerError::from(outcome) {
            OptimizerError::CacheBackendUnavailable { reason, .. } => OptimizerError::CacheBackendUnavailable {
                backend: store.name().to_string(),
                reason,
            },
            other => other,
        };
        warn!(operation, key, error = %error, "Cache level unavailable, continuing without it");
        None
    }
}
