//! Module result cache.
//!
//! Results memoize under `(module name, canonical input hash)` with a
//! per-entry TTL. The default backend is in-memory; Redis/Memcached
//! style backends implement [`CacheBackend`] and plug in through the
//! runtime configuration.

use crate::value::CValue;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Pluggable cache contract. Implementations are shared across runs and
/// must TTL-check on read.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<CValue>;
    fn put(&self, key: String, value: CValue, ttl: Duration);
}

/// Cache key: module name plus the canonical hash of the inputs. Hits
/// require equal canonicalized input values, never just equal call
/// sites.
pub fn cache_key(module_name: &str, input_hash: &str) -> String {
    format!("{module_name}:{input_hash}")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CValue,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// Hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Default in-memory TTL cache.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
    stats: CacheStats,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Drop expired entries. Reads already ignore them; this reclaims
    /// the memory.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| entry.is_fresh());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheBackend for InMemoryCache {
    fn get(&self, key: &str) -> Option<CValue> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                // Expired; treat as a miss and let the writer replace it
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: String, value: CValue, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_round_trip() {
        let cache = InMemoryCache::new();
        cache.put(
            cache_key("m", "abc"),
            CValue::Int(42),
            Duration::from_secs(60),
        );
        assert_eq!(cache.get(&cache_key("m", "abc")), Some(CValue::Int(42)));
        assert_eq!(cache.stats().hits(), 1);
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = InMemoryCache::new();
        cache.put("k".to_string(), CValue::Int(1), Duration::ZERO);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_keys_separate_modules() {
        let cache = InMemoryCache::new();
        cache.put(
            cache_key("a", "h"),
            CValue::Int(1),
            Duration::from_secs(60),
        );
        assert_eq!(cache.get(&cache_key("b", "h")), None);
    }

    #[test]
    fn test_purge_expired() {
        let cache = InMemoryCache::new();
        cache.put("stale".to_string(), CValue::Int(1), Duration::ZERO);
        cache.put(
            "fresh".to_string(),
            CValue::Int(2),
            Duration::from_secs(60),
        );
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
    }
}
