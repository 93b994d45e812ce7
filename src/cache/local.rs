//! In-process cache backend
//!
//! Bounded map with per-entry TTL, used when no shared Redis instance is
//! configured and by tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use measure_cache::cache::{CacheBackend, LocalCache};
//! use std::time::Duration;
//!
//! let cache = LocalCache::new(1000);
//! cache.set("k", b"v".to_vec(), Duration::from_secs(60)).await?;
//! assert_eq!(cache.get("k").await?, Some(b"v".to_vec()));
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::CacheBackend;
use crate::error::CacheError;

/// Cached value with TTL tracking
#[derive(Clone, Debug)]
struct CachedEntry {
    data: Vec<u8>,
    /// Milliseconds since epoch
    cached_at: i64,
    ttl_ms: i64,
}

impl CachedEntry {
    fn new(data: Vec<u8>, ttl_ms: i64) -> Self {
        Self {
            data,
            cached_at: Utc::now().timestamp_millis(),
            ttl_ms,
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() - self.cached_at > self.ttl_ms
    }
}

/// In-memory cache backend with TTL expiry and bounded size
///
/// At capacity, expired entries are evicted first, then the oldest entry.
pub struct LocalCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
    max_entries: usize,
    sets: AtomicU64,
}

impl LocalCache {
    /// Create a cache holding at most `max_entries` values
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            sets: AtomicU64::new(0),
        }
    }

    /// Current entry count (including expired)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check if cache is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Check for a live entry without copying it
    pub async fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .await
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// Number of successful `set` calls since creation
    pub fn set_count(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    /// Remove all expired entries, returning how many were dropped
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, v| !v.is_expired());
        before - entries.len()
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|cached| !cached.is_expired())
            .map(|cached| cached.data.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        const MAX_TTL_MS: i64 = 365 * 24 * 60 * 60 * 1000;
        let ttl_ms = i64::try_from(ttl.as_millis())
            .unwrap_or(MAX_TTL_MS)
            .clamp(0, MAX_TTL_MS);

        let mut entries = self.entries.write().await;

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, v| !v.is_expired());

            if entries.len() >= self.max_entries {
                let oldest_key = entries
                    .iter()
                    .min_by_key(|(_, v)| v.cached_at)
                    .map(|(k, _)| k.clone());

                if let Some(k) = oldest_key {
                    entries.remove(&k);
                }
            }
        }

        entries.insert(key.to_string(), CachedEntry::new(value, ttl_ms));
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expired() {
        let mut cached = CachedEntry::new(b"data".to_vec(), 1);
        cached.cached_at = Utc::now().timestamp_millis() - 1000;
        assert!(cached.is_expired());
    }

    #[tokio::test]
    async fn test_set_get() {
        let cache = LocalCache::new(100);

        cache.set("a", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();
        cache.set("b", b"2".to_vec(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.get("b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(cache.get("c").await.unwrap(), None);
        assert_eq!(cache.set_count(), 2);
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let cache = LocalCache::new(3);

        cache.set("1", b"v1".to_vec(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set("2", b"v2".to_vec(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set("3", b"v3".to_vec(), Duration::from_secs(60)).await.unwrap();

        cache.set("4", b"v4".to_vec(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.len().await, 3);
        assert!(!cache.contains("1").await);
        assert!(cache.contains("4").await);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = LocalCache::new(2);

        cache.set("1", b"a".to_vec(), Duration::from_secs(60)).await.unwrap();
        cache.set("2", b"b".to_vec(), Duration::from_secs(60)).await.unwrap();
        cache.set("2", b"c".to_vec(), Duration::from_secs(60)).await.unwrap();

        assert!(cache.contains("1").await);
        assert_eq!(cache.get("2").await.unwrap(), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let cache = LocalCache::new(100);

        cache.set("1", b"v1".to_vec(), Duration::from_millis(1)).await.unwrap();
        cache.set("2", b"v2".to_vec(), Duration::from_millis(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.cleanup_expired().await, 2);
        assert!(cache.is_empty().await);
    }
}
