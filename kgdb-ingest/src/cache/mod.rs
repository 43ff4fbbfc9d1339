//! Namespaced key/value cache with per-entry TTL
//!
//! `CacheStore` fronts a persistent primary backend (SQLite) with a bounded
//! in-process fallback. Primary failures are logged and absorbed: a cache
//! outage never fails the caller.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use async_trait::async_trait;
use kgdb_common::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Storage behind a `CacheStore`
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;
    async fn set(&self, namespace: &str, key: &str, value: &Value, ttl: Duration) -> Result<()>;
    /// Remove entries whose `namespace:key` matches a `*` glob
    async fn invalidate(&self, pattern: &str) -> Result<u64>;
    async fn purge_expired(&self) -> Result<u64>;
}

/// Fallback cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Cache handle shared by every fetch client in the process
#[derive(Clone)]
pub struct CacheStore {
    primary: Option<Arc<dyn CacheBackend>>,
    fallback: Arc<MemoryCache>,
}

impl CacheStore {
    pub fn new(primary: Option<Arc<dyn CacheBackend>>, fallback_capacity: usize) -> Self {
        Self {
            primary,
            fallback: Arc::new(MemoryCache::new(fallback_capacity)),
        }
    }

    /// Primary store on the service database
    pub fn with_sqlite(pool: SqlitePool, fallback_capacity: usize) -> Self {
        Self::new(Some(Arc::new(SqliteCache::new(pool))), fallback_capacity)
    }

    /// Process-local cache only
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(None, capacity)
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        if let Some(primary) = &self.primary {
            match primary.get(namespace, key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => {
                    warn!(namespace, error = %e, "Primary cache read failed, using fallback");
                }
            }
        }
        // Entries written while the primary was down live only in the fallback
        self.fallback.get_value(namespace, key)
    }

    pub async fn set(&self, namespace: &str, key: &str, value: &Value, ttl: Duration) {
        if let Some(primary) = &self.primary {
            match primary.set(namespace, key, value, ttl).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(namespace, error = %e, "Primary cache write failed, using fallback");
                }
            }
        }
        self.fallback.set_value(namespace, key, value.clone(), ttl);
    }

    /// Remove matching entries from both tiers, returning how many went away
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        let mut removed = self.fallback.invalidate_matching(pattern);
        if let Some(primary) = &self.primary {
            match primary.invalidate(pattern).await {
                Ok(count) => removed += count,
                Err(e) => warn!(pattern, error = %e, "Primary cache invalidation failed"),
            }
        }
        debug!(pattern, removed, "Cache invalidated");
        removed
    }

    pub async fn purge_expired(&self) -> u64 {
        let mut purged = self.fallback.purge();
        if let Some(primary) = &self.primary {
            match primary.purge_expired().await {
                Ok(count) => purged += count,
                Err(e) => warn!(error = %e, "Primary cache purge failed"),
            }
        }
        purged
    }

    pub fn fallback_stats(&self) -> CacheStats {
        self.fallback.stats()
    }
}

/// Deterministic key for an (endpoint, params) pair.
///
/// Parameters are sorted so that ordering at the call site does not matter.
pub fn request_cache_key(endpoint: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!("{:x}", Sha256::digest(format!("{}?{}", endpoint, query).as_bytes()))
}

/// `*`-only glob match
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !text.starts_with(first) || text.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &text[first.len()..];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgdb_common::Error;
    use serde_json::json;

    /// Backend that is always down
    struct Unreachable;

    #[async_trait]
    impl CacheBackend for Unreachable {
        async fn get(&self, _: &str, _: &str) -> Result<Option<Value>> {
            Err(Error::Internal("connection refused".to_string()))
        }
        async fn set(&self, _: &str, _: &str, _: &Value, _: Duration) -> Result<()> {
            Err(Error::Internal("connection refused".to_string()))
        }
        async fn invalidate(&self, _: &str) -> Result<u64> {
            Err(Error::Internal("connection refused".to_string()))
        }
        async fn purge_expired(&self) -> Result<u64> {
            Err(Error::Internal("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_primary_falls_back() {
        let store = CacheStore::new(Some(Arc::new(Unreachable)), 4);
        store
            .set("panelapp", "k1", &json!({"n": 1}), Duration::from_secs(60))
            .await;

        assert_eq!(store.get("panelapp", "k1").await, Some(json!({"n": 1})));
        assert_eq!(store.get("panelapp", "missing").await, None);
        assert_eq!(store.invalidate("panelapp:*").await, 1);
        assert_eq!(store.fallback_stats().hits, 1);
    }

    #[test]
    fn test_cache_key_ignores_param_order() {
        let a = request_cache_key(
            "https://example.org/genes",
            &[("page".into(), "2".into()), ("q".into(), "PKD1".into())],
        );
        let b = request_cache_key(
            "https://example.org/genes",
            &[("q".into(), "PKD1".into()), ("page".into(), "2".into())],
        );
        let c = request_cache_key("https://example.org/genes", &[("page".into(), "3".into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("hpo:*", "hpo:abc"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*:ab*", "hpo:abc"));
        assert!(glob_match("hpo:abc", "hpo:abc"));
        assert!(!glob_match("hpo:*", "gencc:abc"));
        assert!(!glob_match("a*a", "a"));
    }
}
