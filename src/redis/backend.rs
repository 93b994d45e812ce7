//! Redis-backed cache for reconciled blocks

use async_trait::async_trait;
use std::time::Duration;

use super::connection::{RedisConfig, RedisPool};
use crate::cache::CacheBackend;
use crate::error::CacheError;

/// Cache backend storing values as plain Redis strings with `EX` expiry
pub struct RedisCacheBackend {
    pool: RedisPool,
}

impl RedisCacheBackend {
    /// Connect to Redis
    pub async fn connect(config: RedisConfig) -> Result<Self, CacheError> {
        Ok(Self {
            pool: RedisPool::new(config).await?,
        })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: RedisPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for health checks and counters
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }
}

/// Redis rejects `EX 0`, so sub-second TTLs round up to one second
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.pool
            .execute(|mut conn| {
                let key = key.to_owned();
                async move {
                    redis::cmd("GET")
                        .arg(&key)
                        .query_async::<Option<Vec<u8>>>(&mut conn)
                        .await
                }
            })
            .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let secs = expiry_secs(ttl);
        self.pool
            .execute(|mut conn| {
                let key = key.to_owned();
                let value = value.clone();
                async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(value)
                        .arg("EX")
                        .arg(secs)
                        .query_async::<()>(&mut conn)
                        .await
                }
            })
            .await
    }
}
