//! Configuration management
//!
//! TOML configuration with environment variable overrides and defaults for
//! every field, so an empty file (or no file at all) yields a working setup.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Upstream time-series service connection
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Block cache and backend settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Stream index refresh cadence
    #[serde(default)]
    pub index: IndexConfig,

    /// Query shaping
    #[serde(default)]
    pub query: QueryConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Upstream time-series service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Host running the time-series service
    #[serde(default = "default_upstream_host")]
    pub host: String,

    /// Port the service listens on for clients
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Timeout for establishing a connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for a complete multi-part response, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Largest frame body accepted from the upstream
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Which distributed cache backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Shared Redis instance
    Redis,
    /// Process-local in-memory cache
    Memory,
}

/// Block cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Backend selection
    #[serde(default = "default_backend")]
    pub backend: CacheBackendKind,

    /// Redis URL, used when `backend = "redis"`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Concurrent Redis operations allowed
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Upper bound on a single cache get/set, in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Number of bins per cache block
    #[serde(default = "default_block_factor")]
    pub block_factor: i64,

    /// TTL for blocks that may still receive data, in seconds
    #[serde(default = "default_short_ttl_secs")]
    pub short_ttl_secs: u64,

    /// TTL for wholly historical blocks, in seconds
    #[serde(default = "default_long_ttl_secs")]
    pub long_ttl_secs: u64,

    /// Capacity of the in-memory backend
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
}

/// Stream index refresh configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    /// Minimum time between new-stream pulls per collection, in seconds
    #[serde(default = "default_stream_refresh_secs")]
    pub stream_refresh_secs: i64,

    /// Minimum time between activity window refreshes, in seconds
    #[serde(default = "default_activity_refresh_secs")]
    pub activity_refresh_secs: i64,
}

/// Query shaping configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Points per graph the automatic binsize aims for
    #[serde(default = "default_target_points")]
    pub target_points: i64,

    /// Extra blocks fetched either side of a "full" detail window
    #[serde(default = "default_full_detail_extra_blocks")]
    pub full_detail_extra_blocks: u32,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_upstream_host() -> String { "localhost".to_string() }
fn default_upstream_port() -> u16 { 61234 }
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_response_timeout_ms() -> u64 { 120_000 }
fn default_max_frame_bytes() -> usize { 64 * 1024 * 1024 }
fn default_backend() -> CacheBackendKind { CacheBackendKind::Redis }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_pool_size() -> u32 { 16 }
fn default_command_timeout_ms() -> u64 { 250 }
fn default_block_factor() -> i64 { 12 }
fn default_short_ttl_secs() -> u64 { 300 }
fn default_long_ttl_secs() -> u64 { 6 * 60 * 60 }
fn default_local_max_entries() -> usize { 100_000 }
fn default_stream_refresh_secs() -> i64 { 5 * 60 }
fn default_activity_refresh_secs() -> i64 { 30 * 60 }
fn default_target_points() -> i64 { 200 }
fn default_full_detail_extra_blocks() -> u32 { 2 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl UpstreamConfig {
    /// `host:port` string for connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Response timeout as a `Duration`
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            pool_size: default_pool_size(),
            command_timeout_ms: default_command_timeout_ms(),
            block_factor: default_block_factor(),
            short_ttl_secs: default_short_ttl_secs(),
            long_ttl_secs: default_long_ttl_secs(),
            local_max_entries: default_local_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Per-operation backend timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// TTL for blocks still receiving data
    pub fn short_ttl(&self) -> Duration {
        Duration::from_secs(self.short_ttl_secs)
    }

    /// TTL for historical blocks
    pub fn long_ttl(&self) -> Duration {
        Duration::from_secs(self.long_ttl_secs)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            stream_refresh_secs: default_stream_refresh_secs(),
            activity_refresh_secs: default_activity_refresh_secs(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            target_points: default_target_points(),
            full_detail_extra_blocks: default_full_detail_extra_blocks(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Upstream
        if let Ok(host) = std::env::var("MCACHE_UPSTREAM_HOST") {
            self.upstream.host = host;
        }
        if let Ok(port) = std::env::var("MCACHE_UPSTREAM_PORT") {
            if let Ok(p) = port.parse() {
                self.upstream.port = p;
            }
        }

        // Cache
        if let Ok(url) = std::env::var("MCACHE_REDIS_URL") {
            self.cache.redis_url = url;
        }
        if let Ok(backend) = std::env::var("MCACHE_CACHE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "redis" => self.cache.backend = CacheBackendKind::Redis,
                "memory" => self.cache.backend = CacheBackendKind::Memory,
                _ => {},
            }
        }
        if let Ok(factor) = std::env::var("MCACHE_BLOCK_FACTOR") {
            if let Ok(f) = factor.parse() {
                self.cache.block_factor = f;
            }
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.upstream.host.is_empty() {
            return Err(ValidationError::MissingField("upstream.host".to_string()));
        }
        if self.upstream.port == 0 {
            return Err(out_of_range("upstream.port", 0, 1, u16::MAX));
        }

        if self.cache.block_factor < 1 || self.cache.block_factor > 1000 {
            return Err(out_of_range("cache.block_factor", self.cache.block_factor, 1, 1000));
        }
        if self.cache.short_ttl_secs == 0 {
            return Err(out_of_range("cache.short_ttl_secs", 0, 1, self.cache.long_ttl_secs));
        }
        if self.cache.short_ttl_secs > self.cache.long_ttl_secs {
            return Err(ValidationError::InvalidFormat {
                field: "cache.short_ttl_secs".to_string(),
                message: "must not exceed cache.long_ttl_secs".to_string(),
            });
        }
        if self.cache.backend == CacheBackendKind::Redis && self.cache.redis_url.is_empty() {
            return Err(ValidationError::MissingField("cache.redis_url".to_string()));
        }

        if self.index.stream_refresh_secs < 0 {
            return Err(out_of_range(
                "index.stream_refresh_secs",
                self.index.stream_refresh_secs,
                0,
                i64::MAX,
            ));
        }

        if self.query.target_points < 1 {
            return Err(out_of_range("query.target_points", self.query.target_points, 1, i64::MAX));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}

fn out_of_range(
    field: &str,
    value: impl ToString,
    min: impl ToString,
    max: impl ToString,
) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.upstream.port, 61234);
        assert_eq!(config.cache.block_factor, 12);
        assert_eq!(config.cache.short_ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.long_ttl(), Duration::from_secs(21600));
        assert!(config.monitoring.metrics_enabled);
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_block_factor() {
        let mut config = Config::default();
        config.cache.block_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_ttl_above_long_ttl() {
        let mut config = Config::default();
        config.cache.short_ttl_secs = config.cache.long_ttl_secs + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            backend = "memory"
            block_factor = 24
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert_eq!(config.cache.block_factor, 24);
        assert_eq!(config.upstream.host, "localhost");
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MCACHE_UPSTREAM_PORT", "9999");
        let config = Config::from_env();
        assert_eq!(config.upstream.port, 9999);
        std::env::remove_var("MCACHE_UPSTREAM_PORT");
    }
}
