//! Gap-filled series assembly
//!
//! `SeriesReconciler` answers history queries for a set of labels by
//! combining cached blocks with upstream data for whatever is missing:
//!
//! 1. Align the window to blocks and look every block up per label
//! 2. Group identical missing ranges across labels and issue one upstream
//!    request per distinct range
//! 3. Walk each uncached block bin by bin, keeping at most one upstream row
//!    per bin and inserting gap markers elsewhere
//! 4. Write the freshly reconciled blocks back, skipping any block that
//!    overlaps a range the upstream timed out on
//!
//! A connection or protocol failure aborts the whole query before anything
//! is cached. Upstream query timeouts are not errors: they are reported in
//! [`HistoryResult::timed_out`].

pub mod binsize;
pub mod block;

pub use binsize::auto_binsize;
pub use block::reconcile_block;

use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, error, warn};

use crate::cache::BlockCache;
use crate::collection::CollectionAdapter;
use crate::config::QueryConfig;
use crate::error::{CollectionError, Result};
use crate::index::StreamIndex;
use crate::metrics;
use crate::source::{CollectionId, HistoryRequest, LabelHistory, TimeSeriesSource};
use crate::types::{Block, Clock, DataPoint, Label, StreamId, TimeRange, Timestamp};

/// A history query over one collection
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    /// Series to assemble
    pub labels: Vec<Label>,

    /// Window start, inclusive
    pub start: Timestamp,

    /// Window end, exclusive
    pub end: Timestamp,

    /// Detail level selecting columns and aggregation
    pub detail: String,

    /// Pinned bin size, or `None` to let the collection choose
    pub binsize: Option<i64>,

    /// Drop blocks touched by an upstream timeout instead of gap filling
    pub omit_timed_out: bool,
}

impl HistoryQuery {
    /// Query `labels` over `[start, end)` at `detail` with an automatic bin size
    pub fn new(labels: Vec<Label>, start: Timestamp, end: Timestamp, detail: &str) -> Self {
        Self {
            labels,
            start,
            end,
            detail: detail.to_string(),
            binsize: None,
            omit_timed_out: false,
        }
    }

    /// Pin the bin size
    pub fn with_binsize(mut self, binsize: i64) -> Self {
        self.binsize = Some(binsize);
        self
    }

    /// Omit timed-out blocks from the result
    pub fn omitting_timed_out(mut self) -> Self {
        self.omit_timed_out = true;
        self
    }
}

/// Assembled series per label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryResult {
    /// Bin size the series were assembled at
    pub binsize: i64,

    /// Points per label, ascending by bin
    pub series: BTreeMap<String, Vec<DataPoint>>,

    /// Sub-ranges the upstream timed out on, per label
    pub timed_out: BTreeMap<String, Vec<TimeRange>>,
}

/// Result of a "last N seconds" query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentResult {
    /// Summary points per label
    pub series: BTreeMap<String, Vec<DataPoint>>,

    /// Labels whose summary was cut short by an upstream timeout
    pub timed_out: Vec<String>,
}

/// Per-label state of one history query
struct LabelPlan {
    label: String,
    streams: Vec<StreamId>,
    cached: HashMap<Timestamp, Vec<DataPoint>>,
    missing: Vec<TimeRange>,
}

/// Reconciles cached blocks and upstream data for one collection
pub struct SeriesReconciler<'a> {
    collection: CollectionId,
    adapter: &'a dyn CollectionAdapter,
    index: &'a RwLock<StreamIndex>,
    cache: &'a BlockCache,
    source: &'a dyn TimeSeriesSource,
    clock: &'a dyn Clock,
    config: &'a QueryConfig,
}

impl<'a> SeriesReconciler<'a> {
    /// Borrow the parts of a collection needed to answer queries
    pub fn new(
        collection: CollectionId,
        adapter: &'a dyn CollectionAdapter,
        index: &'a RwLock<StreamIndex>,
        cache: &'a BlockCache,
        source: &'a dyn TimeSeriesSource,
        clock: &'a dyn Clock,
        config: &'a QueryConfig,
    ) -> Self {
        Self {
            collection,
            adapter,
            index,
            cache,
            source,
            clock,
            config,
        }
    }

    /// Assemble complete series for every label in `query`
    pub async fn assemble_history(&self, query: &HistoryQuery) -> Result<HistoryResult> {
        let detail = query.detail.as_str();
        let binsize = match query.binsize {
            Some(binsize) => binsize,
            None => self.adapter.calculate_binsize(
                query.start,
                query.end,
                detail,
                self.config.target_points,
            ),
        };

        let extra = self
            .adapter
            .extra_blocks(detail, self.config.full_detail_extra_blocks);
        let blocks = self.cache.get_blocks(query.start, query.end, binsize, extra);

        let mut result = HistoryResult {
            binsize,
            ..Default::default()
        };
        let (first, last) = match (blocks.first(), blocks.last()) {
            (Some(first), Some(last)) => (first.start, last.end),
            _ => {
                for label in &query.labels {
                    result.series.insert(label.label.clone(), Vec::new());
                }
                return Ok(result);
            },
        };

        let columns = self
            .adapter
            .detail_columns(detail)
            .ok_or_else(|| CollectionError::UnsupportedDetail(detail.to_string()))?;

        let active: Vec<Vec<StreamId>> = {
            let index = self.index.read();
            query
                .labels
                .iter()
                .map(|label| index.filter_active(&label.streams, first, last))
                .collect()
        };

        let searches = join_all(
            query
                .labels
                .iter()
                .map(|label| self.cache.search_blocks(&blocks, &label.label, detail)),
        )
        .await;

        let mut plans: Vec<LabelPlan> = query
            .labels
            .iter()
            .zip(active)
            .zip(searches)
            .map(|((label, streams), search)| LabelPlan {
                label: label.label.clone(),
                streams,
                cached: search.cached,
                missing: search.missing,
            })
            .collect();

        // One request per distinct range, carrying every label that needs it
        let mut by_range: BTreeMap<TimeRange, BTreeMap<String, Vec<StreamId>>> = BTreeMap::new();
        for plan in plans.iter().filter(|plan| !plan.streams.is_empty()) {
            for range in &plan.missing {
                by_range
                    .entry(*range)
                    .or_default()
                    .insert(plan.label.clone(), plan.streams.clone());
            }
        }

        let group_by = self.adapter.group_columns(detail);
        let requests: Vec<HistoryRequest> = by_range
            .into_iter()
            .map(|(range, labels)| HistoryRequest {
                collection: self.collection,
                labels,
                start: range.start,
                end: range.end - 1,
                binsize,
                columns: columns.columns.clone(),
                aggregators: columns.aggregators.clone(),
                group_by: group_by.clone(),
            })
            .collect();

        debug!(
            collection = %self.adapter.name(),
            labels = query.labels.len(),
            blocks = blocks.len(),
            requests = requests.len(),
            binsize,
            "Assembling history"
        );

        let responses = try_join_all(requests.iter().map(|request| self.source.request_history(request)))
            .await
            .map_err(|e| {
                error!(
                    collection = %self.adapter.name(),
                    start = query.start,
                    end = query.end,
                    error = %e,
                    "Aborting history query"
                );
                e
            })?;

        let mut histories: BTreeMap<String, LabelHistory> = BTreeMap::new();
        for response in responses {
            for (label, part) in response {
                let merged = histories.entry(label).or_default();
                if merged.frequency == 0 {
                    merged.frequency = part.frequency;
                }
                merged.data.extend(part.data);
                merged.timed_out.extend(part.timed_out);
            }
        }

        let now = self.clock.now();
        let mut pending: Vec<(&Block, String, Vec<DataPoint>, Vec<TimeRange>)> = Vec::new();

        for plan in plans.iter_mut() {
            let history = histories.remove(&plan.label).unwrap_or_default();
            if !history.timed_out.is_empty() {
                warn!(
                    collection = %self.adapter.name(),
                    label = %plan.label,
                    ranges = history.timed_out.len(),
                    "Upstream timed out on part of the query"
                );
                metrics::record_upstream_timeout(self.adapter.name());
            }

            let frequency = if history.frequency > 0 {
                history.frequency
            } else {
                binsize
            };
            let mut queried: VecDeque<DataPoint> = history.data.into();
            let mut series = Vec::new();

            for block in &blocks {
                if let Some(points) = plan.cached.remove(&block.start) {
                    series.extend(points);
                    continue;
                }

                let points = reconcile_block(block, &mut queried, frequency, now, |point| {
                    self.adapter.format_point(point, frequency, detail)
                });

                let tainted = history
                    .timed_out
                    .iter()
                    .any(|failed| failed.overlaps(&block.range()));
                if !(tainted && query.omit_timed_out) {
                    series.extend(points.iter().cloned());
                }
                pending.push((block, plan.label.clone(), points, history.timed_out.clone()));
            }

            if !history.timed_out.is_empty() {
                result
                    .timed_out
                    .insert(plan.label.clone(), history.timed_out);
            }
            result.series.insert(plan.label.clone(), series);
        }

        join_all(pending.iter().map(|(block, label, points, failed)| {
            self.cache.store_block(block, points, label, detail, failed)
        }))
        .await;

        Ok(result)
    }

    /// Summaries of the last `duration` seconds for each label
    ///
    /// Cached summaries are served as-is; the rest are fetched in a single
    /// upstream request using one bin covering the whole duration.
    pub async fn fetch_recent(
        &self,
        labels: &[Label],
        duration: i64,
        detail: &str,
    ) -> Result<RecentResult> {
        let mut result = RecentResult::default();
        let mut wanted: BTreeMap<String, Vec<StreamId>> = BTreeMap::new();

        for label in labels {
            if label.streams.is_empty() {
                result.series.insert(label.label.clone(), Vec::new());
                continue;
            }
            match self.cache.search_recent(&label.label, duration, detail).await {
                Some(points) => {
                    result.series.insert(label.label.clone(), points);
                },
                None => {
                    wanted.insert(label.label.clone(), label.streams.clone());
                },
            }
        }

        if wanted.is_empty() {
            return Ok(result);
        }

        let columns = self
            .adapter
            .detail_columns(detail)
            .ok_or_else(|| CollectionError::UnsupportedDetail(detail.to_string()))?;
        let now = self.clock.now();
        let request = HistoryRequest {
            collection: self.collection,
            labels: wanted.clone(),
            start: now - duration,
            end: now,
            binsize: duration,
            columns: columns.columns,
            aggregators: columns.aggregators,
            group_by: self.adapter.group_columns(detail),
        };

        let mut response = self.source.request_history(&request).await.map_err(|e| {
            error!(
                collection = %self.adapter.name(),
                duration,
                error = %e,
                "Aborting recent data query"
            );
            e
        })?;

        for label in wanted.into_keys() {
            let history = response.remove(&label).unwrap_or_default();
            let frequency = history.frequency;
            let points: Vec<DataPoint> = history
                .data
                .into_iter()
                .map(|point| self.adapter.format_point(point, frequency, detail))
                .collect();

            if history.timed_out.is_empty() {
                self.cache
                    .store_recent(&label, duration, detail, &points)
                    .await;
            } else {
                warn!(
                    collection = %self.adapter.name(),
                    label = %label,
                    duration,
                    "Recent data query timed out, not caching"
                );
                metrics::record_upstream_timeout(self.adapter.name());
                result.timed_out.push(label.clone());
            }
            result.series.insert(label, points);
        }

        Ok(result)
    }
}
