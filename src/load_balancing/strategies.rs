//! Instance selection algorithms.
//!
//! Strategies only pick an index into a candidate slice that the balancer
//! has already filtered to healthy, circuit-closed instances. Ties go to the
//! first candidate in iteration order.

use crate::core::error::OptimizerError;
use crate::core::types::{SelectionContext, ServiceInstance};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Floor for response times in the weighted score
const RESPONSE_TIME_EPSILON: f64 = 1e-3;

/// Selectable algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
}

impl LoadBalancingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingAlgorithm::RoundRobin => "round_robin",
            LoadBalancingAlgorithm::LeastConnections => "least_connections",
            LoadBalancingAlgorithm::Weighted => "weighted",
            LoadBalancingAlgorithm::IpHash => "ip_hash",
        }
    }

    /// Build the strategy implementing this algorithm
    pub fn build(self) -> Box<dyn BalancingStrategy> {
        match self {
            LoadBalancingAlgorithm::RoundRobin => Box::new(RoundRobin::new()),
            LoadBalancingAlgorithm::LeastConnections => Box::new(LeastConnections),
            LoadBalancingAlgorithm::Weighted => Box::new(Weighted),
            LoadBalancingAlgorithm::IpHash => Box::new(IpHash::new()),
        }
    }
}

impl fmt::Display for LoadBalancingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingAlgorithm {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" => Ok(LoadBalancingAlgorithm::RoundRobin),
            "least_connections" => Ok(LoadBalancingAlgorithm::LeastConnections),
            "weighted" => Ok(LoadBalancingAlgorithm::Weighted),
            "ip_hash" => Ok(LoadBalancingAlgorithm::IpHash),
            other => Err(OptimizerError::config(format!(
                "Unknown load balancing algorithm: {}",
                other
            ))),
        }
    }
}

pub trait BalancingStrategy: Send + Sync {
    /// Pick one of `candidates`; `None` only when the slice is empty
    fn select(
        &self,
        service_type: &str,
        candidates: &[ServiceInstance],
        context: Option<&SelectionContext>,
    ) -> Option<usize>;

    fn algorithm(&self) -> LoadBalancingAlgorithm;
}

/// Cyclic index per service type, persisted across calls
pub struct RoundRobin {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancingStrategy for RoundRobin {
    fn select(&self, service_type: &str, candidates: &[ServiceInstance], _: Option<&SelectionContext>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let counter = self
            .counters
            .entry(service_type.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        Some(counter.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::RoundRobin
    }
}

/// Minimum `active_connections`
pub struct LeastConnections;

impl BalancingStrategy for LeastConnections {
    fn select(&self, _: &str, candidates: &[ServiceInstance], _: Option<&SelectionContext>) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (index, instance) in candidates.iter().enumerate() {
            match best {
                Some((_, connections)) if instance.active_connections >= connections => {}
                _ => best = Some((index, instance.active_connections)),
            }
        }
        best.map(|(index, _)| index)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::LeastConnections
    }
}

/// Random pick proportional to a capacity score
pub struct Weighted;

impl Weighted {
    /// `weight / max(response_time, eps) * (1 - cpu/100) * (1 - mem/100)`, never negative
    pub fn score(instance: &ServiceInstance) -> f64 {
        let response_time = instance.response_time.max(RESPONSE_TIME_EPSILON);
        let cpu_headroom = (1.0 - instance.cpu_usage / 100.0).max(0.0);
        let memory_headroom = (1.0 - instance.memory_usage / 100.0).max(0.0);
        (instance.weight.max(0.0) / response_time * cpu_headroom * memory_headroom).max(0.0)
    }

    fn pick(scores: &[f64], roll: f64) -> Option<usize> {
        let mut cumulative = 0.0;
        for (index, score) in scores.iter().enumerate() {
            cumulative += score;
            if roll < cumulative {
                return Some(index);
            }
        }
        // Rounding can leave roll == total; the last positive score owns the tail
        scores.iter().rposition(|s| *s > 0.0)
    }
}

impl BalancingStrategy for Weighted {
    fn select(&self, _: &str, candidates: &[ServiceInstance], _: Option<&SelectionContext>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let scores: Vec<f64> = candidates.iter().map(Self::score).collect();
        let total: f64 = scores.iter().sum();
        if !(total > 0.0) || !total.is_finite() {
            return Some(0);
        }

        let roll = rand::thread_rng().gen_range(0.0..total);
        Self::pick(&scores, roll).or(Some(0))
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::Weighted
    }
}

/// Deterministic hash of the caller's affinity key; round robin for keyless callers
#[derive(Default)]
pub struct IpHash {
    fallback: RoundRobin,
}

impl IpHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a string to u64
    pub fn hash_key(key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[0..8]);
        u64::from_be_bytes(bytes)
    }
}

impl BalancingStrategy for IpHash {
    fn select(
        &self,
        service_type: &str,
        candidates: &[ServiceInstance],
        context: Option<&SelectionContext>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match context.and_then(|c| c.affinity_key.as_deref()) {
            Some(key) => Some((Self::hash_key(key) % candidates.len() as u64) as usize),
            None => self.fallback.select(service_type, candidates, None),
        }
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::IpHash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| ServiceInstance::new(format!("i-{}", i), "svc", "10.0.0.1", 8000 + i as u16))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles_per_service_type() {
        let rr = RoundRobin::new();
        let instances = pool(3);

        let picks: Vec<_> = (0..4).map(|_| rr.select("a", &instances, None).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
        // Independent cursor for another service type
        assert_eq!(rr.select("b", &instances, None), Some(0));
        assert_eq!(rr.select("a", &[], None), None);
    }

    #[test]
    fn test_least_connections_first_wins_ties() {
        let mut instances = pool(3);
        instances[0].active_connections = 4;
        instances[1].active_connections = 1;
        instances[2].active_connections = 1;

        assert_eq!(LeastConnections.select("svc", &instances, None), Some(1));
    }

    #[test]
    fn test_weighted_score_and_pick() {
        let mut instances = pool(2);
        instances[0].response_time = 0.5;
        instances[0].cpu_usage = 50.0;
        instances[1].cpu_usage = 100.0;

        assert!((Weighted::score(&instances[0]) - 1.0).abs() < 1e-9);
        assert_eq!(Weighted::score(&instances[1]), 0.0);

        // Only the first instance has capacity
        for _ in 0..20 {
            assert_eq!(Weighted.select("svc", &instances, None), Some(0));
        }

        assert_eq!(Weighted::pick(&[1.0, 3.0], 0.5), Some(0));
        assert_eq!(Weighted::pick(&[1.0, 3.0], 1.5), Some(1));
        assert_eq!(Weighted::pick(&[1.0, 3.0], 4.0), Some(1));
    }

    #[test]
    fn test_weighted_all_zero_falls_back_to_first() {
        let mut instances = pool(2);
        for instance in &mut instances {
            instance.weight = 0.0;
        }
        assert_eq!(Weighted.select("svc", &instances, None), Some(0));
    }

    #[test]
    fn test_ip_hash_affinity() {
        let instances = pool(5);
        let ctx = SelectionContext::with_affinity("203.0.113.9");

        let ip_hash = IpHash::new();

        let first = ip_hash.select("svc", &instances, Some(&ctx));
        for _ in 0..10 {
            assert_eq!(ip_hash.select("svc", &instances, Some(&ctx)), first);
        }
    }

    #[test]
    fn test_ip_hash_without_key_rotates() {
        let instances = pool(3);
        let ip_hash = IpHash::new();

        let picks: Vec<_> = (0..6).map(|_| ip_hash.select("svc", &instances, None).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);

        let keyless = SelectionContext::default();
        assert_eq!(ip_hash.select("svc", &instances, Some(&keyless)), Some(0));
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("ip_hash".parse::<LoadBalancingAlgorithm>().unwrap(), LoadBalancingAlgorithm::IpHash);
        assert!("random".parse::<LoadBalancingAlgorithm>().is_err());
        assert_eq!(LoadBalancingAlgorithm::Weighted.build().algorithm(), LoadBalancingAlgorithm::Weighted);
    }
}
