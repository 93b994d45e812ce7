//! Upstream time-series service
//!
//! The caching layer consumes the upstream through the `TimeSeriesSource`
//! trait. `UpstreamClient` implements it over the framed TCP protocol in
//! [`protocol`]; tests substitute scripted sources.
//!
//! # Request types
//!
//! - **Collections**: which measurement collections exist
//! - **Streams**: streams first seen after a given stream id
//! - **Active streams**: ids of streams updated since a timestamp
//! - **Aggregate history**: binned data for a set of labels, streamed back
//!   per label with a continuation flag, possibly interrupted by query
//!   cancellations for sub-ranges

pub mod client;
pub mod protocol;

pub use client::UpstreamClient;
pub use protocol::{FrameCodec, Message, MessageType};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SourceError;
use crate::types::{DataPoint, Properties, PropertyValue, StreamId, TimeRange, Timestamp};

/// Upstream identifier of a collection
pub type CollectionId = i64;

/// A measurement collection known to the upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Upstream collection id
    pub id: CollectionId,

    /// Measurement family, e.g. "amp"
    pub module: String,

    /// Measurement type within the family, e.g. "icmp"
    pub modsubtype: String,
}

impl CollectionInfo {
    /// Name used to look the collection up, e.g. "amp-icmp"
    pub fn name(&self) -> String {
        format!("{}-{}", self.module, self.modsubtype)
    }
}

/// One stream as described by the upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Upstream stream id
    pub stream_id: StreamId,

    /// First measurement time, 0 if unknown
    #[serde(default)]
    pub firsttimestamp: Timestamp,

    /// Latest measurement time, 0 if the stream has no data
    #[serde(default)]
    pub lasttimestamp: Timestamp,

    /// Collection-specific descriptive properties
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl StreamRecord {
    /// Convert the descriptive properties for indexing
    pub fn index_properties(&self) -> Properties {
        self.properties
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::from_json(v)))
            .collect()
    }
}

/// Aggregate history request
///
/// `end` is inclusive, as the upstream expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Collection being queried
    pub collection: CollectionId,

    /// Streams combined into each label
    pub labels: BTreeMap<String, Vec<StreamId>>,

    /// First second to include
    pub start: Timestamp,

    /// Last second to include
    pub end: Timestamp,

    /// Aggregation bin width in seconds
    pub binsize: i64,

    /// Columns to aggregate
    pub columns: Vec<String>,

    /// Aggregation function per column, same order as `columns`
    pub aggregators: Vec<String>,

    /// Columns added to the upstream GROUP BY
    #[serde(default)]
    pub group_by: Vec<String>,
}

/// History returned for one label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelHistory {
    /// Measurement frequency reported by the upstream, in seconds
    pub frequency: i64,

    /// Aggregated rows, ascending by time
    pub data: Vec<DataPoint>,

    /// Sub-ranges the upstream gave up on, as half-open ranges
    pub timed_out: Vec<TimeRange>,
}

/// The upstream time-series service
#[async_trait]
pub trait TimeSeriesSource: Send + Sync + 'static {
    /// List every collection
    async fn request_collections(&self) -> Result<Vec<CollectionInfo>, SourceError>;

    /// Streams with an id greater than `since`
    async fn request_streams(
        &self,
        collection: CollectionId,
        since: StreamId,
    ) -> Result<Vec<StreamRecord>, SourceError>;

    /// Ids of streams that received data after `since`
    async fn request_active_streams(
        &self,
        collection: CollectionId,
        since: Timestamp,
    ) -> Result<Vec<StreamId>, SourceError>;

    /// Aggregated history for every label in `request`
    ///
    /// Labels the upstream never answered for are absent from the map.
    async fn request_history(
        &self,
        request: &HistoryRequest,
    ) -> Result<BTreeMap<String, LabelHistory>, SourceError>;
}
