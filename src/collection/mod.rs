//! Measurement collections
//!
//! A [`Collection`] pairs one upstream collection with its own stream index,
//! block cache and refresh bookkeeping, so unrelated collections never
//! contend on a lock. Measurement-specific behavior comes from a
//! [`CollectionAdapter`]; [`CollectionRegistry`] builds collections on
//! demand and is the entry point for the serving layer.
//!
//! # Locking
//!
//! The stream index sits behind a `parking_lot::RwLock`: queries read it
//! concurrently, refreshes take it exclusively. A refresh fetches from the
//! upstream *before* taking the write lock, and concurrent refreshes of one
//! collection are serialized by an async mutex around the bookkeeping, so
//! readers never wait on the network.

pub mod adapter;
pub mod icmp;
pub mod registry;

pub use adapter::{CollectionAdapter, DetailColumns};
pub use icmp::AmpIcmp;
pub use registry::CollectionRegistry;

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::BlockCache;
use crate::config::{IndexConfig, QueryConfig};
use crate::error::Result;
use crate::index::{SelectionPage, SelectionQuery, StreamIndex};
use crate::metrics;
use crate::reconcile::{HistoryQuery, HistoryResult, RecentResult, SeriesReconciler};
use crate::source::{CollectionId, TimeSeriesSource};
use crate::types::{Clock, Label, Properties, StreamId, Timestamp};

/// What a refresh has already pulled from the upstream
#[derive(Debug, Default)]
struct RefreshState {
    last_checked: Option<Timestamp>,
    last_stream_id: StreamId,
    last_activity_check: Option<Timestamp>,
}

/// Outcome of one [`Collection::update_streams`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Streams newly inserted into the index
    pub added: usize,

    /// Streams the index rejected
    pub rejected: usize,

    /// Streams whose activity window was extended
    pub active: usize,
}

/// One upstream collection with its index and cache
pub struct Collection {
    id: CollectionId,
    adapter: Arc<dyn CollectionAdapter>,
    index: RwLock<StreamIndex>,
    cache: BlockCache,
    clock: Arc<dyn Clock>,
    index_config: IndexConfig,
    query_config: QueryConfig,
    refresh: Mutex<RefreshState>,
}

impl Collection {
    /// Create an empty collection
    pub fn new(
        id: CollectionId,
        adapter: Arc<dyn CollectionAdapter>,
        cache: BlockCache,
        clock: Arc<dyn Clock>,
        index_config: IndexConfig,
        query_config: QueryConfig,
    ) -> Self {
        let index = StreamIndex::new(adapter.stream_properties());
        Self {
            id,
            adapter,
            index: RwLock::new(index),
            cache,
            clock,
            index_config,
            query_config,
            refresh: Mutex::new(RefreshState::default()),
        }
    }

    /// Upstream collection id
    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// Collection name, e.g. "amp-icmp"
    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    /// Measurement-specific hooks
    pub fn adapter(&self) -> &dyn CollectionAdapter {
        self.adapter.as_ref()
    }

    /// Block cache for this collection
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Number of indexed streams
    pub fn stream_count(&self) -> usize {
        self.index.read().len()
    }

    /// Pull new streams and recent activity from the upstream
    ///
    /// New streams are fetched at most once per `stream_refresh_secs` and
    /// activity at most once per `activity_refresh_secs`. A stream the
    /// index rejects is logged and skipped. An upstream failure leaves the
    /// bookkeeping untouched so the next call retries.
    pub async fn update_streams(&self, source: &dyn TimeSeriesSource) -> Result<RefreshSummary> {
        let mut state = self.refresh.lock().await;
        let now = self.clock.now();
        let mut summary = RefreshSummary::default();

        let streams_due = state
            .last_checked
            .map_or(true, |last| now - last >= self.index_config.stream_refresh_secs);

        if streams_due {
            let records = source.request_streams(self.id, state.last_stream_id).await?;
            let prepared: Vec<_> = records
                .iter()
                .map(|record| (record, self.adapter.prepare_stream(record)))
                .collect();

            {
                let mut index = self.index.write();
                for (record, (properties, payload)) in prepared {
                    state.last_stream_id = state.last_stream_id.max(record.stream_id);

                    match index.add_stream(record.stream_id, payload, &properties) {
                        Ok(()) => {
                            summary.added += 1;
                            if record.lasttimestamp != 0 {
                                index.update_active_stream(record.stream_id, record.firsttimestamp);
                                index.update_active_stream(record.stream_id, record.lasttimestamp);
                            }
                        },
                        Err(e) => {
                            warn!(
                                collection = %self.name(),
                                stream_id = record.stream_id,
                                error = %e,
                                "Skipping stream"
                            );
                            metrics::record_stream_insert_failure(self.name());
                            summary.rejected += 1;
                        },
                    }
                }
                metrics::update_indexed_streams(self.name(), index.len());
            }

            if state.last_checked.is_none() {
                // Stream records carry their own activity on first load
                state.last_activity_check = Some(now);
            }
            state.last_checked = Some(now);

            info!(
                collection = %self.name(),
                added = summary.added,
                rejected = summary.rejected,
                last_stream_id = state.last_stream_id,
                "Refreshed streams"
            );
        }

        let activity_due = state
            .last_activity_check
            .map_or(false, |last| now - last >= self.index_config.activity_refresh_secs);

        if activity_due {
            let since = state.last_activity_check.unwrap_or(now);
            let active = source.request_active_streams(self.id, since).await?;

            {
                let mut index = self.index.write();
                for id in &active {
                    index.update_active_stream(*id, now);
                }
            }

            summary.active = active.len();
            state.last_activity_check = Some(now);
            debug!(
                collection = %self.name(),
                active = summary.active,
                since,
                "Refreshed stream activity"
            );
        }

        Ok(summary)
    }

    /// Options for progressive selection, descending through single choices
    ///
    /// Each level with exactly one option is selected automatically and the
    /// next level reported too, so callers can fill several dropdowns at
    /// once. A selection that does not exist yields no options.
    pub fn get_selections(&self, query: &SelectionQuery) -> Vec<(String, SelectionPage)> {
        let index = self.index.read();
        let mut query = query.clone();
        let mut pages = Vec::new();

        loop {
            let page = match index.find_selections(&query) {
                Ok(page) => page,
                Err(e) => {
                    warn!(collection = %self.name(), error = %e, "Invalid selection");
                    return Vec::new();
                },
            };

            let key = match page.key.clone() {
                Some(key) => key,
                None => break,
            };

            let only = if page.is_singleton() {
                page.items.first().map(|item| item.id.clone())
            } else {
                None
            };
            pages.push((key.clone(), page));

            match only {
                Some(value) => {
                    query = SelectionQuery {
                        selected: query.selected,
                        ..SelectionQuery::new()
                    }
                    .select(&key, value);
                },
                None => break,
            }
        }

        pages
    }

    /// Stream ids matching a partial property set
    pub fn find_streams(&self, partial: &Properties) -> Vec<StreamId> {
        self.index.read().find_stream_ids(partial)
    }

    /// Properties of one stream
    pub fn find_stream(&self, id: StreamId) -> Option<Properties> {
        self.index.read().find_stream_properties(id).cloned()
    }

    /// Resolve a saved group into labels
    pub fn group_to_labels(&self, group_id: i64, description: &str) -> Result<Vec<Label>> {
        let index = self.index.read();
        Ok(self.adapter.group_to_labels(group_id, description, &index)?)
    }

    /// Assemble gap-filled history for `query`
    pub async fn history(
        &self,
        source: &dyn TimeSeriesSource,
        query: &HistoryQuery,
    ) -> Result<HistoryResult> {
        self.reconciler(source).assemble_history(query).await
    }

    /// Summaries of the last `duration` seconds
    pub async fn recent(
        &self,
        source: &dyn TimeSeriesSource,
        labels: &[Label],
        duration: i64,
        detail: &str,
    ) -> Result<RecentResult> {
        self.reconciler(source)
            .fetch_recent(labels, duration, detail)
            .await
    }

    fn reconciler<'a>(&'a self, source: &'a dyn TimeSeriesSource) -> SeriesReconciler<'a> {
        SeriesReconciler::new(
            self.id,
            self.adapter.as_ref(),
            &self.index,
            &self.cache,
            source,
            self.clock.as_ref(),
            &self.query_config,
        )
    }
}
