//! Bounded in-process cache
//!
//! Used when the primary store is unreachable. Entries carry their own
//! expiry; when the entry cap is exceeded the entry that expires soonest is
//! evicted first. A `BTreeMap` keyed by (expiry, sequence) keeps eviction at
//! O(log n).

use async_trait::async_trait;
use kgdb_common::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{glob_match, CacheBackend, CacheStats};

/// Longest lifetime an entry gets; longer TTLs are clamped
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct Entry {
    value: Value,
    expires_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// (expiry, insertion sequence) -> entry key
    expiry_index: BTreeMap<(Instant, u64), String>,
    next_seq: u64,
    stats: CacheStats,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.expiry_index.remove(&(entry.expires_at, entry.seq));
        Some(entry)
    }
}

/// Fallback cache with oldest-expiry-first eviction
pub struct MemoryCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn entry_key(namespace: &str, key: &str) -> String {
        format!("{}:{}", namespace, key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the maps consistent (every
        // mutation is a single insert/remove pair), so poisoning is ignored
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_value(&self, namespace: &str, key: &str) -> Option<Value> {
        let full_key = Self::entry_key(namespace, key);
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(&full_key) {
            Some(entry) if entry.expires_at > now => {
                let value = entry.value.clone();
                inner.stats.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove(&full_key);
        }
        inner.stats.misses += 1;
        None
    }

    pub fn set_value(&self, namespace: &str, key: &str, value: Value, ttl: Duration) {
        let full_key = Self::entry_key(namespace, key);
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now);
        let mut inner = self.lock();

        inner.remove(&full_key);

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.expiry_index.insert((expires_at, seq), full_key.clone());
        inner.entries.insert(
            full_key,
            Entry {
                value,
                expires_at,
                seq,
            },
        );

        while inner.entries.len() > self.capacity {
            let Some((_, victim)) = inner.expiry_index.pop_first() else {
                break;
            };
            inner.entries.remove(&victim);
            inner.stats.evictions += 1;
        }
    }

    pub fn invalidate_matching(&self, pattern: &str) -> u64 {
        let mut inner = self.lock();
        let victims: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        for key in &victims {
            inner.remove(key);
        }
        victims.len() as u64
    }

    pub fn purge(&self) -> u64 {
        let mut inner = self.lock();
        let now = Instant::now();
        let mut purged = 0;
        while let Some((&(expires_at, seq), _)) = inner.expiry_index.first_key_value() {
            if expires_at > now {
                break;
            }
            if let Some(key) = inner.expiry_index.remove(&(expires_at, seq)) {
                inner.entries.remove(&key);
                purged += 1;
            }
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.get_value(namespace, key))
    }

    async fn set(&self, namespace: &str, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        self.set_value(namespace, key, value.clone(), ttl);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64> {
        Ok(self.invalidate_matching(pattern))
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(self.purge())
    }
}
