//! Core data types shared by the index, the block cache and the reconciler
//!
//! # Key Types
//!
//! - **`PropertyValue`**: One value of a stream property (source, packet size, ...)
//! - **`DataPoint`**: Aggregated measurement values for one bin, or a gap marker
//! - **`TimeRange`**: Half-open time window `[start, end)` in seconds
//! - **`Block`**: Cache-aligned span of bins, the unit of cache storage
//! - **`Label`**: Named aggregate of stream ids drawn as a single series
//! - **`Clock`**: Source of "now", injectable for tests
//!
//! # Example
//!
//! ```rust
//! use measure_cache::types::{DataPoint, TimeRange};
//!
//! let gap = DataPoint::gap(300);
//! assert!(gap.is_gap());
//!
//! let range = TimeRange::new(0, 3600).unwrap();
//! assert!(range.contains(1800));
//! assert!(!range.contains(3600));
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Upstream identifier of an atomic measurement stream
pub type StreamId = u64;

/// Unix timestamp in seconds
pub type Timestamp = i64;

/// Ordered mapping of property name to value describing a stream or a selection
pub type Properties = BTreeMap<String, PropertyValue>;

/// Value of a single stream property
///
/// Upstream stream records carry strings, integers and booleans. Values are
/// totally ordered so that selection options come back in a stable order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean property (e.g. a "random" flag)
    Bool(bool),
    /// Integer property (e.g. a port number)
    Int(i64),
    /// Free-form string property (site names, packet sizes, families)
    Str(String),
}

impl PropertyValue {
    /// Convert a JSON value from an upstream stream record
    ///
    /// Non-scalar values fall back to their JSON text so the stream can
    /// still be indexed.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => PropertyValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::Str(n.to_string()),
            },
            serde_json::Value::String(s) => PropertyValue::Str(s.clone()),
            serde_json::Value::Null => PropertyValue::Str(String::new()),
            other => PropertyValue::Str(other.to_string()),
        }
    }

    /// Borrow the string form if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// Aggregated measurement values for one bin
///
/// A point with no `values` is a gap marker: it tells renderers that no
/// measurement exists for the bin starting at `binstart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Start of the bin this point belongs to
    pub binstart: Timestamp,

    /// Timestamp of the measurement (equals `binstart` for gaps)
    pub timestamp: Timestamp,

    /// Measurement fields, sorted by name for stable serialization
    #[serde(flatten)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl DataPoint {
    /// Create a point carrying measurement values
    pub fn new(
        binstart: Timestamp,
        timestamp: Timestamp,
        values: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            binstart,
            timestamp,
            values,
        }
    }

    /// Create a gap marker for the bin starting at `ts`
    pub fn gap(ts: Timestamp) -> Self {
        Self {
            binstart: ts,
            timestamp: ts,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style helper to attach a measurement field
    pub fn with_value(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// True if this point carries no measurement fields
    pub fn is_gap(&self) -> bool {
        self.values.is_empty()
    }

    /// Read a numeric field, if present
    pub fn value_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(|v| v.as_f64())
    }
}

/// Half-open time window `[start, end)` in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,

    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range, rejecting `start > end`
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, crate::error::Error> {
        if start > end {
            return Err(crate::error::Error::Configuration(format!(
                "Invalid time range: start {} > end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Create a range without validation
    pub const fn new_unchecked(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check whether `ts` falls inside the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check whether two half-open ranges share at least one second
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Length of the range in seconds
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A fixed-size, time-aligned span of bins
///
/// Blocks never overlap and always start on a multiple of
/// `binsize * block_factor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// First second covered by the block
    pub start: Timestamp,

    /// First second after the block
    pub end: Timestamp,

    /// Width of each bin in seconds
    pub binsize: i64,

    /// How long the block may live in the cache
    pub ttl: Duration,
}

impl Block {
    /// The block's span as a time range
    pub fn range(&self) -> TimeRange {
        TimeRange::new_unchecked(self.start, self.end)
    }

    /// Number of bins of `binsize` that fit in the block
    pub fn bin_count(&self) -> usize {
        if self.binsize <= 0 {
            return 0;
        }
        ((self.end - self.start) / self.binsize) as usize
    }
}

/// A named aggregate of streams displayed as one series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Unique string identifying the label (also used in cache keys)
    pub label: String,

    /// Streams combined to form the series
    pub streams: Vec<StreamId>,

    /// Short text distinguishing this label within its group
    pub short_label: String,
}

impl Label {
    /// Create a label
    pub fn new(label: impl Into<String>, streams: Vec<StreamId>, short_label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            streams,
            short_label: short_label.into(),
        }
    }
}

/// Source of the current time
///
/// Block TTLs and the "never synthesize future bins" rule depend on "now",
/// so it is injected rather than read from the system clock directly.
pub trait Clock: Send + Sync + 'static {
    /// Current Unix time in seconds
    fn now(&self) -> Timestamp;
}

/// Wall-clock time via chrono
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp()
    }
}

/// Manually controlled clock
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    /// Create a clock frozen at `now`
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Move the clock to `now`
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward by `secs`
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
