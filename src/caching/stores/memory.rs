//! # In-Memory Cache Store
//!
//! Bounded in-process cache with LRU eviction and per-entry absolute expiry.
//!
//! Entries live in an `IndexMap` whose iteration order is the recency list:
//! the front is least recently used, the back most recently used. A read moves
//! the key to the back; an insert that pushes the map over capacity evicts from
//! the front. Expired entries are removed lazily on read and in bulk by
//! [`InMemoryCache::cleanup_expired`], which the maintenance loop calls.

use super::{CacheEntry, CacheStore, CacheStoreStats};
use crate::caching::CacheResult;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Default capacity when none is configured
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// In-memory cache implementation
pub struct InMemoryCache {
    /// Maximum number of entries
    max_entries: usize,

    /// Entries in recency order
    entries: Mutex<IndexMap<String, CacheEntry>>,

    /// Atomic counters for statistics
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: AtomicU64,
}

impl InMemoryCache {
    /// Create a new in-memory cache holding at most `max_entries` entries
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_cleanups: AtomicU64::new(0),
        }
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Current number of entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.expired_cleanups.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    fn evict_over_capacity(&self, entries: &mut IndexMap<String, CacheEntry>) {
        let mut evicted = 0u64;
        while entries.len() > self.max_entries {
            if let Some((key, _)) = entries.shift_remove_index(0) {
                debug!(key = %key, "Evicted least recently used cache entry");
                evicted += 1;
            } else {
                break;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();

        let Some(index) = entries.get_index_of(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if entries[index].is_expired() {
            entries.shift_remove_index(index);
            self.expired_cleanups.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        // The back of the map is the most recently used end
        let last = entries.len() - 1;
        entries.move_index(index, last);
        let entry = &mut entries[last];
        entry.mark_accessed();
        let value = entry.value.clone();

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let entry = CacheEntry::new(value.to_vec(), ttl);

        let mut entries = self.entries.lock();
        match entries.get_index_of(key) {
            Some(index) => {
                let last = entries.len() - 1;
                entries.move_index(index, last);
                entries[last] = entry;
            }
            None => {
                entries.insert(key.to_string(), entry);
                self.evict_over_capacity(&mut entries);
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.lock().shift_remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .entries
            .lock()
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut entries = self.entries.lock();
        let entry_count = entries.len();
        entries.clear();
        debug!("Cleared {} entries from in-memory cache", entry_count);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize> {
        match pattern.strip_suffix('*') {
            Some(prefix) => Ok(self.delete_by_prefix(prefix)),
            None => Ok(usize::from(self.delete(pattern).await?)),
        }
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let (entries, memory_usage) = {
            let entries = self.entries.lock();
            (entries.len(), entries.values().map(|e| e.size).sum())
        };

        Ok(CacheStoreStats {
            entries,
            memory_usage,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
            errors: 0,
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(self.entries.lock().len() <= self.max_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_basic_operations() {
        let cache = InMemoryCache::default();

        cache.set("test_key", b"test_value", MINUTE).await.unwrap();
        assert_eq!(cache.get("test_key").await.unwrap(), Some(b"test_value".to_vec()));
        assert!(cache.exists("test_key").await.unwrap());

        assert!(cache.delete("test_key").await.unwrap());
        assert!(!cache.exists("test_key").await.unwrap());
        assert!(!cache.delete("test_key").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration() {
        let cache = InMemoryCache::default();
        cache.set("expire_test", b"v", Duration::from_secs(1)).await.unwrap();

        assert_eq!(cache.get("expire_test").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_millis(1_100)).await;

        assert_eq!(cache.get("expire_test").await.unwrap(), None);
        // Expired entry was removed on read
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_recent_reads() {
        let cache = InMemoryCache::new(3);

        cache.set("key1", b"1", MINUTE).await.unwrap();
        cache.set("key2", b"2", MINUTE).await.unwrap();
        cache.set("key3", b"3", MINUTE).await.unwrap();

        // Touch key1 so key2 becomes least recently used
        cache.get("key1").await.unwrap();
        cache.set("key4", b"4", MINUTE).await.unwrap();

        assert!(!cache.exists("key2").await.unwrap());
        assert!(cache.exists("key1").await.unwrap());
        assert!(cache.exists("key3").await.unwrap());
        assert!(cache.exists("key4").await.unwrap());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_refreshes_recency() {
        let cache = InMemoryCache::new(2);
        cache.set("a", b"1", MINUTE).await.unwrap();
        cache.set("b", b"2", MINUTE).await.unwrap();
        cache.set("a", b"3", MINUTE).await.unwrap();
        cache.set("c", b"4", MINUTE).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), Some(b"3".to_vec()));
        assert!(!cache.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_hits_move_entries_to_most_recent_end() {
        let cache = InMemoryCache::default();
        for key in ["a", "b", "c", "d"] {
            cache.set(key, key.as_bytes(), MINUTE).await.unwrap();
        }

        cache.get("b").await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", b"c2", MINUTE).await.unwrap();

        let order: Vec<String> = cache.entries.lock().keys().cloned().collect();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
        assert_eq!(cache.entries.lock()["a"].access_count, 1);
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let cache = InMemoryCache::default();
        cache.set("short", b"x", Duration::from_secs(1)).await.unwrap();
        cache.set("long", b"y", MINUTE).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().await.unwrap().expired_cleanups, 1);
    }

    #[tokio::test]
    async fn test_delete_by_pattern() {
        let cache = InMemoryCache::default();
        cache.set("cache:a:1", b"x", MINUTE).await.unwrap();
        cache.set("cache:a:2", b"x", MINUTE).await.unwrap();
        cache.set("cache:b:1", b"x", MINUTE).await.unwrap();

        assert_eq!(cache.delete_by_pattern("cache:a:*").await.unwrap(), 2);
        assert!(cache.exists("cache:b:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = InMemoryCache::default();

        cache.set("key1", b"value1", MINUTE).await.unwrap();
        cache.get("key1").await.unwrap();
        cache.get("key2").await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.memory_usage > 0);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
