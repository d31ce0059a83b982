//! # Caching Integration Tests
//!
//! Exercises the cache manager and its levels through the public API.

use production_optimizer::caching::{
    get_or_compute, CacheConfig, CacheKey, CacheLevel, CacheManager, CacheStore, CacheTypeConfig, InMemoryCache,
    RedisCache, RedisCacheConfig,
};
use production_optimizer::OptimizerError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn memory_only_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    for type_config in config.cache_types.values_mut() {
        type_config.levels = vec![CacheLevel::Memory];
    }
    config
}

#[test]
fn test_key_is_independent_of_param_order() {
    let a = CacheKey::params([("company", json!("acme")), ("year", json!(2024)), ("quarter", json!("Q3"))]);
    let b = CacheKey::params([("quarter", json!("Q3")), ("company", json!("acme")), ("year", json!(2024))]);

    let key_a = CacheKey::derive("financial_analysis", &a);
    let key_b = CacheKey::derive("financial_analysis", &b);
    assert_eq!(key_a, key_b);
    assert!(key_a.as_str().starts_with("cache:financial_analysis:"));

    let other_type = CacheKey::derive("compliance_check", &a);
    assert_ne!(key_a, other_type);
}

#[tokio::test(start_paused = true)]
async fn test_memory_entry_expires_after_ttl() {
    let cache = InMemoryCache::new(16);
    cache.set("k", b"v", Duration::from_secs(1)).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

    tokio::time::advance(Duration::from_millis(1100)).await;
    assert_eq!(cache.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_memory_lru_evicts_least_recently_used() {
    let cache = InMemoryCache::new(3);
    let ttl = Duration::from_secs(60);

    cache.set("k1", b"1", ttl).await.unwrap();
    cache.set("k2", b"2", ttl).await.unwrap();
    cache.set("k3", b"3", ttl).await.unwrap();
    assert!(cache.get("k1").await.unwrap().is_some());
    cache.set("k4", b"4", ttl).await.unwrap();

    assert!(cache.exists("k1").await.unwrap());
    assert!(!cache.exists("k2").await.unwrap());
    assert!(cache.exists("k3").await.unwrap());
    assert!(cache.exists("k4").await.unwrap());
    assert_eq!(cache.len(), 3);
}

#[tokio::test]
async fn test_structured_value_round_trip() {
    let manager = CacheManager::new(memory_only_config());
    let params = CacheKey::params([("report", "quarterly")]);
    let value = json!({
        "summary": {"revenue": 1_250_000.5, "currency": "EUR"},
        "segments": [{"name": "retail", "share": 0.4}, {"name": "wholesale", "share": 0.6}],
        "flags": [true, false, null],
    });

    manager.set("financial_analysis", &value, &params).await.unwrap();
    let read: Option<Value> = manager.get("financial_analysis", &params).await.unwrap();
    assert_eq!(read, Some(value));
}

#[tokio::test]
async fn test_invalidate_removes_single_key() {
    let manager = CacheManager::new(memory_only_config());
    let acme = CacheKey::params([("company", "acme")]);
    let globex = CacheKey::params([("company", "globex")]);

    manager.set("compliance_check", &json!("ok"), &acme).await.unwrap();
    manager.set("compliance_check", &json!("ok"), &globex).await.unwrap();

    assert!(manager.invalidate("compliance_check", &acme).await.unwrap());
    assert!(!manager.exists("compliance_check", &acme).await.unwrap());
    assert!(manager.exists("compliance_check", &globex).await.unwrap());
}

#[tokio::test]
async fn test_tag_invalidation_and_clear_all() {
    let manager = CacheManager::new(memory_only_config());
    let params = CacheKey::params([("id", 7)]);

    manager.set("ai_responses", &json!("answer"), &params).await.unwrap();
    manager.set("user_sessions", &json!("session"), &params).await.unwrap();

    let invalidated = manager.invalidate_by_tags(["llm"]).await;
    assert_eq!(invalidated, vec!["ai_responses".to_string()]);
    assert!(!manager.exists("ai_responses", &params).await.unwrap());
    assert!(manager.exists("user_sessions", &params).await.unwrap());

    manager.clear_all().await;
    assert!(!manager.exists("user_sessions", &params).await.unwrap());
}

#[tokio::test]
async fn test_custom_cache_type_table() {
    let mut config = CacheConfig::default();
    config.cache_types.clear();
    config.cache_types.insert(
        "reports".to_string(),
        CacheTypeConfig {
            ttl: Duration::from_secs(30),
            max_entries: Some(2),
            levels: vec![CacheLevel::Memory],
            tags: vec!["reporting".to_string()],
        },
    );
    let manager = CacheManager::new(config);
    let params = CacheKey::params([("id", 1)]);

    manager.set("reports", &json!(1), &params).await.unwrap();
    let err = manager.set("financial_analysis", &json!(1), &params).await.unwrap_err();
    assert!(matches!(err, OptimizerError::UnknownCacheType { .. }));
}

#[tokio::test]
async fn test_get_or_compute_runs_operation_once() {
    let manager = CacheManager::new(memory_only_config());
    let params = CacheKey::params([("symbol", "ACME")]);
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let value: Value = get_or_compute(&manager, "market_intelligence", &params, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"trend": "up"}))
        })
        .await
        .unwrap();
        assert_eq!(value["trend"], "up");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = manager.stats().await;
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_unreachable_redis_degrades_to_memory() {
    let mut config = CacheConfig::default();
    config.redis = RedisCacheConfig {
        enabled: true,
        port: 1,
        connection_timeout: Duration::from_millis(100),
        operation_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let manager = CacheManager::new(config);
    let params = CacheKey::params([("company", "acme")]);

    manager.set("financial_analysis", &json!({"score": 85.5}), &params).await.unwrap();
    let value: Option<Value> = manager.get("financial_analysis", &params).await.unwrap();
    assert_eq!(value, Some(json!({"score": 85.5})));
    assert_eq!(manager.health_check().await.distributed, Some(false));
}

#[tokio::test]
#[ignore = "requires a running Redis server (REDIS_URL)"]
async fn test_redis_round_trip() {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = RedisCache::new(RedisCacheConfig {
        enabled: true,
        url: Some(url),
        key_prefix: "optimizer-test:".to_string(),
        ..Default::default()
    });

    store.set("cache:it:1", b"payload", Duration::from_secs(30)).await.unwrap();
    assert_eq!(store.get("cache:it:1").await.unwrap(), Some(b"payload".to_vec()));
    assert_eq!(store.delete_by_pattern("cache:it:*").await.unwrap(), 1);
    assert!(store.health_check().await.unwrap());
}
