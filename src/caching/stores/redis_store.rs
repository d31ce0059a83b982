//! # Redis Cache Store
//!
//! Distributed cache level backed by Redis. TTLs use Redis' native expiry.
//!
//! The connection is established lazily on first use by a background task
//! bounded only by `connection_timeout`. Callers wait for that task, but a
//! caller giving up (the manager's per-operation timeout) does not cancel it,
//! so a slow server still comes up for later requests. A failed attempt is
//! retried at most once per `reconnect_backoff`. Every failure is returned as
//! a `CacheError`; the cache manager decides to absorb it.
//!
//! `clear` and the entry count only touch keys under the cache namespace
//! (`cache:*` after the configured prefix), never the whole database.

use super::{CacheStore, CacheStoreStats};
use crate::caching::key_generator::KEY_NAMESPACE;
use crate::caching::{CacheError, CacheResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Redis cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCacheConfig {
    /// Whether the distributed level is used at all
    pub enabled: bool,

    /// Full connection URL; takes precedence over the discrete fields below
    pub url: Option<String>,

    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Database index
    pub db: i64,

    /// Optional password
    pub password: Option<String>,

    /// Key prefix for all cache entries
    pub key_prefix: String,

    /// Connection timeout
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Bound on a single get/set as seen by the cache manager
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Minimum delay between two connection attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            key_prefix: String::new(),
            connection_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_millis(250),
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

impl RedisCacheConfig {
    /// Connection URL built from the configuration
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Connection URL with the password masked, for logs
    fn display_url(&self) -> String {
        match (&self.url, &self.password) {
            (Some(_), _) => "redis://<configured url>".to_string(),
            (None, Some(_)) => format!("redis://:***@{}:{}/{}", self.host, self.port, self.db),
            (None, None) => self.connection_url(),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    /// Established connection, if any
    connection: Option<ConnectionManager>,

    /// Completion signal of the connect task in flight
    connecting: Option<watch::Receiver<bool>>,

    /// When the last connect attempt failed
    last_failure: Option<Instant>,
}

/// State shared with the background connect task
#[derive(Default)]
struct Shared {
    state: Mutex<ConnectionState>,
    errors: AtomicU64,
}

/// Redis cache implementation
pub struct RedisCache {
    /// Configuration
    config: RedisCacheConfig,

    shared: Arc<Shared>,

    /// Statistics counters
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisCache {
    /// Create a new Redis cache. No connection is made until first use.
    pub fn new(config: RedisCacheConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &RedisCacheConfig {
        &self.config
    }

    /// Get the full cache key with prefix
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Glob matching every key this store owns
    fn namespace_pattern(&self) -> String {
        self.full_key(&format!("{}:*", KEY_NAMESPACE))
    }

    /// Whether a connection has been established
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connection.is_some()
    }

    /// Get the shared connection, starting a connect attempt if none is running
    async fn connection(&self) -> CacheResult<ConnectionManager> {
        let mut done = {
            let mut state = self.shared.state.lock();
            if let Some(conn) = &state.connection {
                return Ok(conn.clone());
            }

            match state.connecting.clone() {
                Some(done) => done,
                None => {
                    let backing_off = state
                        .last_failure
                        .map(|at| at.elapsed() < self.config.reconnect_backoff)
                        .unwrap_or(false);
                    if backing_off {
                        return Err(CacheError::Unavailable);
                    }

                    let (tx, rx) = watch::channel(false);
                    state.connecting = Some(rx.clone());
                    self.spawn_connect(tx);
                    rx
                }
            }
        };

        // A dropped sender also ends the wait; the state below is authoritative
        let _ = done.wait_for(|finished| *finished).await;
        self.shared
            .state
            .lock()
            .connection
            .clone()
            .ok_or(CacheError::Unavailable)
    }

    /// Connect in the background; the outcome lands in the shared state
    fn spawn_connect(&self, done: watch::Sender<bool>) {
        let shared = Arc::clone(&self.shared);
        let url = self.config.connection_url();
        let display_url = self.config.display_url();
        let connect_timeout = self.config.connection_timeout;

        tokio::spawn(async move {
            let outcome = match Client::open(url.as_str()) {
                Ok(client) => match tokio::time::timeout(connect_timeout, ConnectionManager::new(client)).await {
                    Ok(Ok(manager)) => Ok(manager),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", connect_timeout)),
                },
                Err(e) => Err(e.to_string()),
            };

            {
                let mut state = shared.state.lock();
                state.connecting = None;
                match outcome {
                    Ok(manager) => {
                        info!("Redis cache connected to {}", display_url);
                        state.connection = Some(manager);
                        state.last_failure = None;
                    }
                    Err(reason) => {
                        shared.errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Failed to connect to Redis at {}: {}", display_url, reason);
                        state.last_failure = Some(Instant::now());
                    }
                }
            }
            let _ = done.send(true);
        });
    }

    fn record_error(&self, err: redis::RedisError) -> CacheError {
        self.shared.errors.fetch_add(1, Ordering::Relaxed);
        CacheError::Redis(err)
    }

    /// Delete every key matching an already prefixed glob
    async fn delete_matching(&self, full_pattern: &str) -> CacheResult<usize> {
        let mut conn = self.connection().await?;

        let keys = Self::scan_keys(&mut conn, full_pattern)
            .await
            .map_err(|e| self.record_error(e))?;
        if keys.is_empty() {
            return Ok(0);
        }

        let deleted_count: i64 = conn.del(&keys).await.map_err(|e| self.record_error(e))?;
        debug!("Deleted {} Redis keys matching {}", deleted_count, full_pattern);
        Ok(deleted_count.max(0) as usize)
    }

    async fn scan_keys(conn:&mut ConnectionManager, pattern: &str) -> RedisResult<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut all_keys = Vec::new();

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(conn)
                .await?;

            all_keys.extend(keys);

            if new_cursor == 0 {
                break;
            }
            cursor = new_cursor;
        }

        Ok(all_keys)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);

        let value = conn
            .get::<_, Option<Vec<u8>>>(&full_key)
            .await
            .map_err(|e| self.record_error(e))?;

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Redis cache hit for key: {}", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Redis cache miss for key: {}", key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);
        // SETEX rejects a zero expiry
        let ttl_seconds = ttl.as_secs().max(1);

        conn.set_ex::<_, _, ()>(&full_key, value, ttl_seconds)
            .await
            .map_err(|e| self.record_error(e))?;

        debug!("Set Redis cache key: {} with TTL: {:?}", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection().await?;
        let deleted_count: i64 = conn
            .del(self.full_key(key))
            .await
            .map_err(|e| self.record_error(e))?;
        Ok(deleted_count > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection().await?;
        conn.exists(self.full_key(key))
            .await
            .map_err(|e| self.record_error(e))
    }

    async fn clear(&self) -> CacheResult<()> {
        let deleted = self.delete_matching(&self.namespace_pattern()).await?;
        info!("Cleared {} keys from Redis cache", deleted);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize> {
        self.delete_matching(&self.full_key(pattern)).await
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        // Entry count needs a live connection; counters do not
        let entries = match self.connection().await {
            Ok(mut conn) => Self::scan_keys(&mut conn, &self.namespace_pattern())
                .await
                .map(|keys| keys.len())
                .unwrap_or(0),
            Err(_) => 0,
        };

        Ok(CacheStoreStats {
            entries,
            memory_usage: 0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,        // Redis handles eviction internally
            expired_cleanups: 0, // Redis handles TTL cleanup internally
            errors: self.shared.errors.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(false),
        };

        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(response) => Ok(response == "PONG"),
            Err(e) => {
                let _ = self.record_error(e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_from_env() -> RedisCache {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        RedisCache::new(RedisCacheConfig {
            enabled: true,
            url: Some(url),
            key_prefix: format!("test:{}:", uuid::Uuid::new_v4()),
            ..Default::default()
        })
    }

    #[test]
    fn test_connection_url_encodes_password() {
        let config = RedisCacheConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            db: 2,
            password: Some("p@ss word".to_string()),
            ..Default::default()
        };
        assert_eq!(config.connection_url(), "redis://:p%40ss%20word@redis.internal:6380/2");
        assert!(!config.display_url().contains("p%40ss"));
    }

    /// Accepts one client and answers every command with `+OK` after `delay`
    async fn slow_redis(delay: Duration) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let mut first = true;
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if first {
                    tokio::time::sleep(delay).await;
                    first = false;
                }
                // Every RESP command starts with `*` at the beginning of a line
                let commands = (0..n)
                    .filter(|&i| buf[i] == b'*' && (i == 0 || buf[i - 1] == b'\n'))
                    .count();
                for _ in 0..commands {
                    if socket.write_all(b"+OK\r\n").await.is_err() {
                        return;
                    }
                }
            }
        });

        port
    }

    #[test]
    fn test_clear_is_scoped_to_cache_namespace() {
        let unprefixed = RedisCache::new(RedisCacheConfig::default());
        assert_eq!(unprefixed.namespace_pattern(), "cache:*");

        let prefixed = RedisCache::new(RedisCacheConfig {
            key_prefix: "tenant-a:".to_string(),
            ..Default::default()
        });
        assert_eq!(prefixed.namespace_pattern(), "tenant-a:cache:*");
    }

    #[tokio::test]
    async fn test_slow_connect_survives_caller_timeout() {
        let port = slow_redis(Duration::from_millis(300)).await;
        let cache = RedisCache::new(RedisCacheConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            // A non-zero db forces a SELECT round trip during connect
            db: 1,
            connection_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        let first = tokio::time::timeout(Duration::from_millis(50), cache.connection()).await;
        assert!(first.is_err(), "connect should still be in flight");

        for _ in 0..40 {
            if cache.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(cache.is_connected());

        // Already connected, so no backoff and no new attempt
        let second = tokio::time::timeout(Duration::from_millis(50), cache.connection()).await;
        assert!(matches!(second, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error_not_a_panic() {
        let cache = RedisCache::new(RedisCacheConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1,
            connection_timeout: Duration::from_millis(200),
            ..Default::default()
        });

        assert!(cache.get("k").await.is_err());
        // Second attempt inside the backoff window fails fast
        assert!(matches!(cache.get("k").await, Err(CacheError::Unavailable)));
        assert!(!cache.health_check().await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server (REDIS_URL)
    async fn test_basic_operations() {
        let cache = redis_from_env();

        cache.set("test_key", b"test_value", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("test_key").await.unwrap(), Some(b"test_value".to_vec()));
        assert!(cache.exists("test_key").await.unwrap());

        assert!(cache.delete("test_key").await.unwrap());
        assert!(!cache.exists("test_key").await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server (REDIS_URL)
    async fn test_pattern_delete() {
        let cache = redis_from_env();
        cache.set("cache:a:1", b"x", Duration::from_secs(60)).await.unwrap();
        cache.set("cache:a:2", b"x", Duration::from_secs(60)).await.unwrap();
        cache.set("cache:b:1", b"x", Duration::from_secs(60)).await.unwrap();

        cache.set("session:1", b"x", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.delete_by_pattern("cache:a:*").await.unwrap(), 2);
        assert!(cache.exists("cache:b:1").await.unwrap());

        cache.clear().await.unwrap();
        assert!(!cache.exists("cache:b:1").await.unwrap());
        assert!(cache.exists("session:1").await.unwrap());
        cache.delete("session:1").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server (REDIS_URL)
    async fn test_ttl_expiration() {
        let cache = redis_from_env();
        cache.set("expire_test", b"v", Duration::from_secs(1)).await.unwrap();
        assert!(cache.exists("expire_test").await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.get("expire_test").await.unwrap(), None);
    }
}
