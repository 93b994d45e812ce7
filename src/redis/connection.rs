//! Shared Redis connection for cache traffic
//!
//! All cache commands run over one multiplexed connection. A semaphore caps
//! how many are in flight, each attempt is bounded by the command timeout,
//! and a dropped connection is re-established lazily by the next command.
//! Cache lookups sit on the query path, so a failed command is retried at
//! most `reconnect_retries` times after a short jittered pause and then
//! reported; the block cache turns that report into a miss.
//!
//! # Example
//!
//! ```rust,no_run
//! use measure_cache::redis::{RedisConfig, RedisPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::new(RedisConfig::with_url("redis://localhost:6379")).await?;
//! let rtt = pool.ping().await?;
//! println!("redis round trip: {:?}", rtt);
//! # Ok(())
//! # }
//! ```

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::util::safe_redis_error;
use crate::config::CacheConfig;
use crate::error::CacheError;

/// Largest number of in-flight commands accepted
const MAX_IN_FLIGHT: u32 = 1000;

/// Settings for the shared cache connection
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis server URL, e.g. "redis://localhost:6379"
    pub url: String,

    /// Commands allowed in flight at once
    pub max_in_flight: u32,

    /// Bound on establishing the connection
    pub connect_timeout: Duration,

    /// Bound on each command attempt
    pub command_timeout: Duration,

    /// Extra attempts after a connection-level failure
    pub reconnect_retries: u32,

    /// Pause before a retry, jittered by up to a quarter
    pub retry_delay: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_in_flight: 16,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(250),
            reconnect_retries: 1,
            retry_delay: Duration::from_millis(20),
        }
    }
}

impl RedisConfig {
    /// Defaults pointed at `url`
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Take URL, concurrency and command timeout from the cache section
    pub fn from_cache_config(cache: &CacheConfig) -> Self {
        Self {
            url: cache.redis_url.clone(),
            max_in_flight: cache.pool_size,
            command_timeout: cache.command_timeout(),
            ..Default::default()
        }
    }

    /// Disable retries
    pub fn without_retries(mut self) -> Self {
        self.reconnect_retries = 0;
        self
    }

    /// Check the settings before connecting
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL is empty".to_string());
        }
        if self.url.starts_with("rediss://") {
            return Err("rediss:// is not supported, use a local or tunnelled Redis".to_string());
        }
        if self.max_in_flight == 0 || self.max_in_flight > MAX_IN_FLIGHT {
            return Err(format!(
                "max_in_flight must be between 1 and {}, got {}",
                MAX_IN_FLIGHT, self.max_in_flight
            ));
        }
        Ok(())
    }

    fn jittered_delay(&self) -> Duration {
        let factor = 1.0 + rand::random::<f64>() * 0.25;
        self.retry_delay.mul_f64(factor)
    }
}

/// Counters describing connection churn and command outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections established, including reconnects
    pub connects: u64,
    /// Commands that completed
    pub commands: u64,
    /// Command attempts that failed or timed out
    pub failures: u64,
    /// Attempts repeated after a failure
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    commands: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            connects: self.connects.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// One multiplexed Redis connection shared by every cache command
pub struct RedisPool {
    client: Client,
    config: RedisConfig,
    connection: Mutex<Option<MultiplexedConnection>>,
    permits: Semaphore,
    counters: Counters,
}

impl RedisPool {
    /// Open the client and try a first connection
    ///
    /// Only an invalid configuration is an error. An unreachable server is
    /// logged and left to the next command to reconnect, so the cache can
    /// come up after the rest of the system.
    pub async fn new(config: RedisConfig) -> Result<Self, CacheError> {
        config.validate().map_err(CacheError::Backend)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| CacheError::Backend(safe_redis_error(&config.url, &e)))?;

        let pool = Self {
            client,
            permits: Semaphore::new(config.max_in_flight as usize),
            config,
            connection: Mutex::new(None),
            counters: Counters::default(),
        };
        if let Err(e) = pool.connection().await {
            warn!(error = %e, "Redis unavailable, cache lookups will miss until it returns");
        }
        Ok(pool)
    }

    /// The current connection, connecting if there is none
    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let started = Instant::now();
        let conn = timeout(
            self.config.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout)?
        .map_err(|e| CacheError::Backend(safe_redis_error(&self.config.url, &e)))?;

        Counters::bump(&self.counters.connects);
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Connected to Redis");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self) {
        *self.connection.lock().await = None;
    }

    /// Run one command, retrying after connection-level failures
    ///
    /// `command` is called once per attempt with a handle to the shared
    /// connection.
    pub async fn execute<F, Fut, T>(&self, command: F) -> Result<T, CacheError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CacheError::Backend("Redis pool closed".to_string()))?;

        let mut attempt = 0;
        loop {
            let conn = self.connection().await?;
            let error = match timeout(self.config.command_timeout, command(conn)).await {
                Ok(Ok(value)) => {
                    Counters::bump(&self.counters.commands);
                    return Ok(value);
                },
                Ok(Err(e)) => {
                    let retriable = e.is_connection_dropped() || e.is_io_error() || e.is_timeout();
                    if e.is_connection_dropped() || e.is_io_error() {
                        self.forget_connection().await;
                    }
                    if !retriable {
                        Counters::bump(&self.counters.failures);
                        return Err(CacheError::Backend(safe_redis_error(&self.config.url, &e)));
                    }
                    CacheError::Backend(safe_redis_error(&self.config.url, &e))
                },
                Err(_) => CacheError::Timeout,
            };

            Counters::bump(&self.counters.failures);
            if attempt >= self.config.reconnect_retries {
                return Err(error);
            }

            attempt += 1;
            Counters::bump(&self.counters.retries);
            warn!(attempt, error = %error, "Redis command failed, retrying");
            tokio::time::sleep(self.config.jittered_delay()).await;
        }
    }

    /// Round trip time of a PING
    pub async fn ping(&self) -> Result<Duration, CacheError> {
        let started = Instant::now();
        self.execute(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await?;
        Ok(started.elapsed())
    }

    /// Connection and command counters
    pub fn stats(&self) -> PoolStats {
        self.counters.stats()
    }

    /// Settings the pool was built with
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}
