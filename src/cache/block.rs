//! Block cache
//!
//! Translates arbitrary query windows into cache-aligned blocks, finds out
//! which blocks are cached, and governs what may be cached.
//!
//! # Key layout
//!
//! - Blocks: `{namespace}:{label}_{binsize}_{block_start}_{detail}`
//! - Recent summaries: `{namespace}:{label}_recent_{duration}_{detail}`
//!
//! # Failure handling
//!
//! Every backend error or timeout is logged, counted and treated as a miss
//! (for lookups) or a no-op (for stores). The block cache never fails a
//! query.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::CacheBackend;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::metrics;
use crate::types::{Block, Clock, DataPoint, TimeRange, Timestamp};

/// Recent-data TTL tiers: (maximum requested duration, TTL), both in seconds
const RECENT_TTL_TIERS: [(i64, u64); 4] = [
    (10 * 60, 60),
    (60 * 60, 5 * 60),
    (24 * 60 * 60, 30 * 60),
    (7 * 24 * 60 * 60, 3 * 60 * 60),
];

/// TTL for recent data spanning more than a week
const RECENT_TTL_MAX_SECS: u64 = 6 * 60 * 60;

/// Result of looking up a run of blocks for one label
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BlockSearch {
    /// Contiguous uncached ranges, in ascending order
    pub missing: Vec<TimeRange>,

    /// Cached points by block start
    pub cached: HashMap<Timestamp, Vec<DataPoint>>,
}

/// Cache of reconciled blocks for one collection
pub struct BlockCache {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    block_factor: i64,
    short_ttl: Duration,
    long_ttl: Duration,
    op_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl BlockCache {
    /// Create a block cache whose keys are prefixed with `namespace`
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        namespace: impl Into<String>,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            block_factor: config.block_factor.max(1),
            short_ttl: config.short_ttl(),
            long_ttl: config.long_ttl(),
            op_timeout: config.command_timeout(),
            clock,
        }
    }

    /// Key namespace, normally the collection name
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Seconds spanned by one block of `binsize` bins
    pub fn block_size(&self, binsize: i64) -> i64 {
        binsize * self.block_factor
    }

    /// Split `[start, end)` into aligned blocks
    ///
    /// The first block starts at `start` rounded down to a block boundary;
    /// `extra_blocks` blocks of margin are added at both ends. Blocks that
    /// would start after "now" are never produced. A block that has not
    /// ended yet gets the short TTL, all others the long TTL.
    pub fn get_blocks(
        &self,
        start: Timestamp,
        end: Timestamp,
        binsize: i64,
        extra_blocks: u32,
    ) -> Vec<Block> {
        if binsize <= 0 {
            warn!(binsize, "Refusing to build blocks for non-positive binsize");
            return Vec::new();
        }

        let blocksize = self.block_size(binsize);
        let prefetch = i64::from(extra_blocks) * blocksize;
        let now = self.clock.now();

        let mut blocks = Vec::new();
        let mut block_start = start - start.rem_euclid(blocksize) - prefetch;

        while block_start < end + prefetch {
            if block_start > now {
                break;
            }

            let block_end = block_start + blocksize;
            let ttl = if now < block_end {
                self.short_ttl
            } else {
                self.long_ttl
            };

            blocks.push(Block {
                start: block_start,
                end: block_end,
                binsize,
                ttl,
            });
            block_start = block_end;
        }

        blocks
    }

    /// Look up every block for `label`, coalescing consecutive misses
    ///
    /// Lookups are issued concurrently. Each run of adjacent uncached
    /// blocks is reported as a single range so one upstream request can
    /// fill all of them.
    pub async fn search_blocks(&self, blocks: &[Block], label: &str, detail: &str) -> BlockSearch {
        let lookups = blocks.iter().map(|block| {
            let key = self.block_key(label, block.binsize, block.start, detail);
            async move { self.fetch("block", &key).await }
        });
        let results = join_all(lookups).await;

        let mut search = BlockSearch::default();
        let mut current: Option<TimeRange> = None;

        for (block, result) in blocks.iter().zip(results) {
            match result {
                Some(points) => {
                    if let Some(range) = current.take() {
                        search.missing.push(range);
                    }
                    search.cached.insert(block.start, points);
                },
                None => {
                    current = match current.take() {
                        Some(open) if open.end == block.start => {
                            Some(TimeRange::new_unchecked(open.start, block.end))
                        },
                        Some(open) => {
                            search.missing.push(open);
                            Some(block.range())
                        },
                        None => Some(block.range()),
                    };
                },
            }
        }

        if let Some(range) = current {
            search.missing.push(range);
        }

        debug!(
            label = %label,
            blocks = blocks.len(),
            cached = search.cached.len(),
            missing_ranges = search.missing.len(),
            "Searched cached blocks"
        );

        search
    }

    /// Store a reconciled block unless it overlaps a failed range
    ///
    /// `failed` holds the ranges the upstream reported as timed out for
    /// this label. Returns true if the block was written.
    pub async fn store_block(
        &self,
        block: &Block,
        points: &[DataPoint],
        label: &str,
        detail: &str,
        failed: &[TimeRange],
    ) -> bool {
        let range = block.range();
        if let Some(fail) = failed.iter().find(|fail| fail.overlaps(&range)) {
            debug!(
                label = %label,
                block_start = block.start,
                failed = %fail,
                "Not caching block tainted by upstream timeout"
            );
            metrics::record_cache_store("block", "skipped_failed");
            return false;
        }

        let key = self.block_key(label, block.binsize, block.start, detail);
        self.put("block", &key, points, block.ttl).await
    }

    /// Look up a cached "last N seconds" summary
    pub async fn search_recent(
        &self,
        label: &str,
        duration: i64,
        detail: &str,
    ) -> Option<Vec<DataPoint>> {
        let key = self.recent_key(label, duration, detail);
        self.fetch("recent", &key).await
    }

    /// Cache a "last N seconds" summary with a TTL chosen by duration
    pub async fn store_recent(
        &self,
        label: &str,
        duration: i64,
        detail: &str,
        points: &[DataPoint],
    ) -> bool {
        let key = self.recent_key(label, duration, detail);
        self.put("recent", &key, points, recent_ttl(duration)).await
    }

    /// Cache key for one block
    pub fn block_key(&self, label: &str, binsize: i64, block_start: Timestamp, detail: &str) -> String {
        format!(
            "{}:{}_{}_{}_{}",
            self.namespace, label, binsize, block_start, detail
        )
    }

    /// Cache key for a recent summary
    pub fn recent_key(&self, label: &str, duration: i64, detail: &str) -> String {
        format!("{}:{}_recent_{}_{}", self.namespace, label, duration, detail)
    }

    async fn fetch(&self, kind: &str, key: &str) -> Option<Vec<DataPoint>> {
        let result = match timeout(self.op_timeout, self.backend.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout),
        };

        match result {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<DataPoint>>(&bytes) {
                Ok(points) => {
                    metrics::record_cache_lookup(kind, "hit");
                    Some(points)
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                    metrics::record_cache_lookup(kind, "error");
                    None
                },
            },
            Ok(None) => {
                metrics::record_cache_lookup(kind, "miss");
                None
            },
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    key = %key,
                    error = %e,
                    "Cache lookup failed, treating as miss"
                );
                metrics::record_cache_lookup(kind, "error");
                None
            },
        }
    }

    async fn put(&self, kind: &str, key: &str, points: &[DataPoint], ttl: Duration) -> bool {
        let payload = match serde_json::to_vec(points) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode points for cache");
                metrics::record_cache_store(kind, "error");
                return false;
            },
        };

        let result = match timeout(self.op_timeout, self.backend.set(key, payload, ttl)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout),
        };

        match result {
            Ok(()) => {
                metrics::record_cache_store(kind, "stored");
                true
            },
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    key = %key,
                    error = %e,
                    "Cache store failed, continuing without it"
                );
                metrics::record_cache_store(kind, "error");
                false
            },
        }
    }
}

/// TTL for a recent summary covering `duration` seconds
///
/// Short windows change quickly and are cheap to recompute; long windows
/// are expensive upstream and change slowly relative to their length.
pub fn recent_ttl(duration: i64) -> Duration {
    let secs = RECENT_TTL_TIERS
        .iter()
        .find(|(max, _)| duration <= *max)
        .map(|(_, ttl)| *ttl)
        .unwrap_or(RECENT_TTL_MAX_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::types::FixedClock;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
    }

    struct StalledBackend;

    #[async_trait]
    impl CacheBackend for StalledBackend {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn cache_with(backend: Arc<dyn CacheBackend>, now: Timestamp) -> BlockCache {
        BlockCache::new(
            backend,
            "amp-icmp",
            &CacheConfig::default(),
            Arc::new(FixedClock::new(now)),
        )
    }

    fn points_for(block: &Block) -> Vec<DataPoint> {
        (0..block.bin_count() as i64)
            .map(|i| {
                let ts = block.start + i * block.binsize;
                DataPoint::gap(ts).with_value("median", json!(10))
            })
            .collect()
    }

    #[test]
    fn test_two_hour_window_yields_two_blocks() {
        let cache = cache_with(Arc::new(LocalCache::new(10)), 100_000);
        let blocks = cache.get_blocks(0, 7200, 300, 0);

        let ranges: Vec<_> = blocks.iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(ranges, vec![(0, 3600), (3600, 7200)]);
    }

    #[test]
    fn test_unaligned_start_rounds_down() {
        let cache = cache_with(Arc::new(LocalCache::new(10)), 100_000);
        let blocks = cache.get_blocks(4000, 5000, 300, 0);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 3600);
    }

    #[test]
    fn test_ttl_tiers_follow_now() {
        let now = 10_000;
        let cache = cache_with(Arc::new(LocalCache::new(10)), now);
        let blocks = cache.get_blocks(0, 20_000, 300, 0);

        // Nothing starts after now
        assert!(blocks.iter().all(|b| b.start <= now));
        let last = blocks.last().unwrap();
        assert!(last.end > now);
        assert_eq!(last.ttl, Duration::from_secs(300));

        let historical = blocks.iter().find(|b| b.end < now - 3600).unwrap();
        assert_eq!(historical.ttl, Duration::from_secs(21_600));
    }

    #[test]
    fn test_extra_blocks_pad_both_ends() {
        let cache = cache_with(Arc::new(LocalCache::new(10)), 1_000_000);
        let blocks = cache.get_blocks(36_000, 39_600, 300, 2);
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[0].start, 36_000 - 2 * 3600);
        assert_eq!(blocks[4].end, 39_600 + 2 * 3600);
    }

    #[test]
    fn test_non_positive_binsize() {
        let cache = cache_with(Arc::new(LocalCache::new(10)), 1_000_000);
        assert!(cache.get_blocks(0, 7200, 0, 0).is_empty());
    }

    #[test]
    fn test_recent_ttl_tiers() {
        assert_eq!(recent_ttl(600), Duration::from_secs(60));
        assert_eq!(recent_ttl(601), Duration::from_secs(300));
        assert_eq!(recent_ttl(3600), Duration::from_secs(300));
        assert_eq!(recent_ttl(86_400), Duration::from_secs(1800));
        assert_eq!(recent_ttl(7 * 86_400), Duration::from_secs(10_800));
        assert_eq!(recent_ttl(30 * 86_400), Duration::from_secs(21_600));
    }

    #[tokio::test]
    async fn test_consecutive_misses_coalesce() {
        let cache = cache_with(Arc::new(LocalCache::new(100)), 1_000_000);
        let blocks = cache.get_blocks(0, 5 * 3600, 300, 0);

        // Cache only the middle block
        assert!(cache.store_block(&blocks[2], &points_for(&blocks[2]), "l", "full", &[]).await);

        let search = cache.search_blocks(&blocks, "l", "full").await;
        assert_eq!(
            search.missing,
            vec![TimeRange::new_unchecked(0, 7200), TimeRange::new_unchecked(10_800, 18_000)]
        );
        assert_eq!(search.cached.len(), 1);
        assert_eq!(search.cached[&7200].len(), 12);
    }

    #[tokio::test]
    async fn test_failed_range_blocks_are_not_cached() {
        let cache = cache_with(Arc::new(LocalCache::new(100)), 1_000_000);
        let blocks = cache.get_blocks(0, 7200, 300, 0);
        let failed = vec![TimeRange::new_unchecked(3000, 3300)];

        assert!(!cache.store_block(&blocks[0], &points_for(&blocks[0]), "l", "full", &failed).await);
        assert!(cache.store_block(&blocks[1], &points_for(&blocks[1]), "l", "full", &failed).await);

        let search = cache.search_blocks(&blocks, "l", "full").await;
        assert_eq!(search.missing, vec![TimeRange::new_unchecked(0, 3600)]);
    }

    #[tokio::test]
    async fn test_keys_separate_detail_and_label() {
        let cache = cache_with(Arc::new(LocalCache::new(100)), 1_000_000);
        let blocks = cache.get_blocks(0, 3600, 300, 0);
        cache.store_block(&blocks[0], &points_for(&blocks[0]), "l", "full", &[]).await;

        assert_eq!(cache.search_blocks(&blocks, "l", "basic").await.missing.len(), 1);
        assert_eq!(cache.search_blocks(&blocks, "m", "full").await.missing.len(), 1);
        assert!(cache.search_blocks(&blocks, "l", "full").await.missing.is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_is_a_miss() {
        let cache = cache_with(Arc::new(FailingBackend), 1_000_000);
        let blocks = cache.get_blocks(0, 7200, 300, 0);

        assert!(!cache.store_block(&blocks[0], &points_for(&blocks[0]), "l", "full", &[]).await);
        let search = cache.search_blocks(&blocks, "l", "full").await;
        assert_eq!(search.missing, vec![TimeRange::new_unchecked(0, 7200)]);
        assert!(cache.search_recent("l", 600, "basic").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out() {
        let cache = cache_with(Arc::new(StalledBackend), 1_000_000);
        let blocks = cache.get_blocks(0, 3600, 300, 0);

        let search = cache.search_blocks(&blocks, "l", "full").await;
        assert_eq!(search.missing.len(), 1);
        assert!(!cache.store_recent("l", 600, "basic", &[]).await);
    }

    #[tokio::test]
    async fn test_recent_round_trip() {
        let cache = cache_with(Arc::new(LocalCache::new(100)), 1_000_000);
        let points = vec![DataPoint::gap(0).with_value("loss", json!(0))];

        assert!(cache.search_recent("l", 600, "basic").await.is_none());
        assert!(cache.store_recent("l", 600, "basic", &points).await);
        assert_eq!(cache.search_recent("l", 600, "basic").await, Some(points));
        assert!(cache.search_recent("l", 3600, "basic").await.is_none());
    }
}
