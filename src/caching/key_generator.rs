//! # Cache Key Generator
//!
//! Deterministic cache keys of the form `cache:<cache_type>:<hash>`.
//!
//! Parameters are kept in a `BTreeMap` and nested JSON objects serialize with
//! sorted keys, so the same parameter set always produces the same key no
//! matter in which order the caller inserted it.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered parameter set a cache key is derived from
pub type CacheParams = BTreeMap<String, Value>;

/// Namespace shared by every cache key
pub const KEY_NAMESPACE: &str = "cache";

/// Number of hex characters of the digest kept in the key
const DIGEST_HEX_LEN: usize = 32;

/// A derived cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a cache type and parameter set
    pub fn derive(cache_type: &str, params: &CacheParams) -> Self {
        // Serializing a BTreeMap of JSON values cannot fail
        let canonical = serde_json::to_vec(params).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(cache_type.as_bytes());
        hasher.update(b"\0");
        hasher.update(&canonical);
        let digest = hex::encode(hasher.finalize());

        Self(format!(
            "{}:{}:{}",
            KEY_NAMESPACE,
            cache_type,
            &digest[..DIGEST_HEX_LEN]
        ))
    }

    /// Build a parameter set from any iterator of pairs
    pub fn params<K, V, I>(pairs: I) -> CacheParams
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Serialize,
    {
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), serde_json::to_value(v).unwrap_or(Value::Null)))
            .collect()
    }

    /// Key prefix shared by every key of a cache type
    pub fn prefix_for(cache_type: &str) -> String {
        format!("{}:{}:", KEY_NAMESPACE, cache_type)
    }

    /// Glob pattern matching every key of a cache type
    pub fn pattern_for(cache_type: &str) -> String {
        format!("{}*", Self::prefix_for(cache_type))
    }

    /// Borrow the key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_order_independent() {
        let a = CacheKey::params([("company", json!("acme")), ("year", json!(2024))]);
        let b = CacheKey::params([("year", json!(2024)), ("company", json!("acme"))]);

        assert_eq!(
            CacheKey::derive("financial_analysis", &a),
            CacheKey::derive("financial_analysis", &b)
        );
    }

    #[test]
    fn test_nested_objects_are_canonical() {
        let a: CacheParams = serde_json::from_str(r#"{"filter":{"x":1,"y":2}}"#).unwrap();
        let b: CacheParams = serde_json::from_str(r#"{"filter":{"y":2,"x":1}}"#).unwrap();
        assert_eq!(CacheKey::derive("t", &a), CacheKey::derive("t", &b));
    }

    #[test]
    fn test_key_format() {
        let key = CacheKey::derive("ai_responses", &CacheKey::params([("prompt", "hi")]));
        assert!(key.as_str().starts_with(&CacheKey::prefix_for("ai_responses")));
        assert_eq!(key.as_str().len(), "cache:ai_responses:".len() + DIGEST_HEX_LEN);
    }

    #[test]
    fn test_cache_type_changes_key() {
        let params = CacheKey::params([("id", 1)]);
        assert_ne!(
            CacheKey::derive("compliance_check", &params),
            CacheKey::derive("market_intelligence", &params)
        );
    }
}
