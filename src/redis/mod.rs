//! Redis cache backend
//!
//! Blocks and recent summaries are stored as JSON strings under namespaced
//! keys with a native Redis expiry:
//!
//! ```text
//! {collection}:{label}_{binsize}_{block_start}_{detail}  → JSON [DataPoint]  EX ttl
//! {collection}:{label}_recent_{duration}_{detail}        → JSON [DataPoint]  EX ttl
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use measure_cache::redis::{RedisCacheBackend, RedisConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = RedisCacheBackend::connect(RedisConfig::with_url("redis://localhost:6379")).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod connection;
pub mod util;

pub use backend::RedisCacheBackend;
pub use connection::{PoolStats, RedisConfig, RedisPool};
