//! Block cache and the distributed cache backends behind it
//!
//! - **`CacheBackend`**: byte-level get/set with TTL (Redis or in-process)
//! - **`BlockCache`**: block alignment, missing-range coalescing, TTL tiers
//!   and failed-range suppression on top of a backend

pub mod block;
pub mod local;

pub use block::{BlockCache, BlockSearch};
pub use local::LocalCache;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::CacheError;

// =============================================================================
// Cache Backend Trait
// =============================================================================

/// Distributed key/value store holding serialized blocks
///
/// Implementations report failures honestly; the `BlockCache` decides
/// that a failure is a miss.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Backend name used in logs
    fn name(&self) -> &str;

    /// Fetch a value, `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
}
