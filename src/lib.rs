//! Measure Cache - block cache and series reconciliation for measurement data
//!
//! This library sits between a graphing front end and an upstream
//! time-series service that stores network measurements. It provides:
//! - A per-collection stream index for resolving measurement properties to
//!   stream ids and driving drill-down selection menus
//! - An aligned block cache over Redis or memory, with TTLs that follow
//!   data immutability and no caching of partially timed-out ranges
//! - Gap-filled, one-point-per-bin series assembled from cached blocks and
//!   the minimum number of upstream range requests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod index;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Block cache and cache backends
pub mod cache;

/// Redis cache backend over a shared multiplexed connection
pub mod redis;

/// Upstream time-series service client and wire protocol
pub mod source;

/// Per-block reconciliation and history assembly
pub mod reconcile;

/// Measurement collections, adapters and the collection registry
pub mod collection;

// Re-export main types
pub use collection::{Collection, CollectionAdapter, CollectionRegistry};
pub use config::Config;
pub use error::{Error, Result};
pub use reconcile::{HistoryQuery, HistoryResult, RecentResult};
pub use types::{Block, DataPoint, Label, TimeRange};
