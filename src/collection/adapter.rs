//! Per-measurement-type behavior plugged into a collection

use crate::error::CollectionError;
use crate::index::StreamIndex;
use crate::reconcile::binsize::auto_binsize;
use crate::source::StreamRecord;
use crate::types::{DataPoint, Label, Properties, Timestamp};

/// Columns and aggregation functions requested for one detail level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailColumns {
    /// Columns to aggregate
    pub columns: Vec<String>,

    /// Aggregation function per column
    pub aggregators: Vec<String>,
}

impl DetailColumns {
    /// Pair columns with aggregators
    pub fn new(columns: &[&str], aggregators: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            aggregators: aggregators.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Measurement-type specific hooks used by a [`Collection`](super::Collection)
///
/// Only the hooks with no sensible default must be implemented. The
/// defaults match collections measured every few minutes that need no
/// extra formatting.
pub trait CollectionAdapter: Send + Sync + 'static {
    /// Collection name, e.g. "amp-icmp"
    fn name(&self) -> &str;

    /// Ordered property names streams are indexed by
    fn stream_properties(&self) -> Vec<String>;

    /// Columns and aggregators for `detail`, `None` if unsupported
    fn detail_columns(&self, detail: &str) -> Option<DetailColumns>;

    /// Extra upstream GROUP BY columns for `detail`
    fn group_columns(&self, _detail: &str) -> Vec<String> {
        Vec::new()
    }

    /// Turn one aggregated upstream row into its display form
    fn format_point(&self, point: DataPoint, _frequency: i64, _detail: &str) -> DataPoint {
        point
    }

    /// Resolve a saved group description into displayable labels
    fn group_to_labels(
        &self,
        group_id: i64,
        description: &str,
        index: &StreamIndex,
    ) -> Result<Vec<Label>, CollectionError>;

    /// Derive index properties and the stored payload for a new stream
    fn prepare_stream(&self, record: &StreamRecord) -> (Properties, Option<serde_json::Value>) {
        (record.index_properties(), None)
    }

    /// Bin size for a graph of `[start, end)`
    fn calculate_binsize(
        &self,
        start: Timestamp,
        end: Timestamp,
        _detail: &str,
        target_points: i64,
    ) -> i64 {
        auto_binsize(start, end, target_points)
    }

    /// Margin blocks fetched either side of the window
    ///
    /// Only the scrollable "full" graph pays for panning margin.
    fn extra_blocks(&self, detail: &str, configured: u32) -> u32 {
        if detail == "full" {
            configured
        } else {
            0
        }
    }
}
