//! # Cache Benchmarks
//!
//! Key derivation and memory-level get/set, the per-request cache overhead.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use production_optimizer::caching::{CacheConfig, CacheKey, CacheLevel, CacheManager, CacheStore, InMemoryCache};
use serde_json::json;
use std::time::Duration;
use tokio::runtime::Runtime;

fn benchmark_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key");

    for param_count in [1usize, 4, 16] {
        let params = CacheKey::params((0..param_count).map(|i| (format!("param_{}", i), json!({"value": i}))));
        group.bench_with_input(BenchmarkId::new("derive", param_count), &params, |b, params| {
            b.iter(|| CacheKey::derive(black_box("financial_analysis"), black_box(params)))
        });
    }

    group.finish();
}

fn benchmark_memory_store(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("memory_store");

    for value_size in [64usize, 1024, 16384] {
        let cache = InMemoryCache::new(10_000);
        let value = vec![7u8; value_size];
        rt.block_on(cache.set("hot", &value, Duration::from_secs(300))).unwrap();

        group.throughput(Throughput::Bytes(value_size as u64));
        group.bench_with_input(BenchmarkId::new("get_hit", value_size), &value_size, |b, _| {
            b.iter(|| rt.block_on(cache.get(black_box("hot"))).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("set", value_size), &value, |b, value| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let key = format!("k{}", n % 5_000);
                rt.block_on(cache.set(&key, black_box(value), Duration::from_secs(300))).unwrap()
            })
        });
    }

    group.finish();
}

fn benchmark_manager_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut config = CacheConfig::default();
    for type_config in config.cache_types.values_mut() {
        type_config.levels = vec![CacheLevel::Memory];
    }
    let manager = CacheManager::new(config);
    let params = CacheKey::params([("company", "acme"), ("quarter", "Q3")]);
    let value = json!({"score": 85.5, "factors": ["liquidity", "growth", "margin"]});
    rt.block_on(manager.set("financial_analysis", &value, &params)).unwrap();

    c.bench_function("manager_get_hit", |b| {
        b.iter(|| {
            rt.block_on(manager.get::<serde_json::Value>("financial_analysis", black_box(&params)))
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    benchmark_key_derivation,
    benchmark_memory_store,
    benchmark_manager_round_trip
);
criterion_main!(benches);
