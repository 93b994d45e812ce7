//! Shared fixtures for integration tests
//!
//! `ScriptedSource` stands in for the upstream service: it answers history
//! requests with one row per bin (minus configured holes), can report
//! timeouts for chosen ranges or fail outright, and records every call.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use measure_cache::cache::LocalCache;
use measure_cache::config::{CacheBackendKind, Config};
use measure_cache::error::SourceError;
use measure_cache::source::{
    CollectionId, CollectionInfo, HistoryRequest, LabelHistory, StreamRecord, TimeSeriesSource,
};
use measure_cache::types::{DataPoint, FixedClock, StreamId, TimeRange, Timestamp};
use measure_cache::CollectionRegistry;

pub const ICMP_ID: CollectionId = 4;

/// Scripted upstream that counts calls
#[derive(Default)]
pub struct ScriptedSource {
    pub streams: Mutex<Vec<StreamRecord>>,
    pub active: Mutex<Vec<StreamId>>,
    /// Bins that have no measurement
    pub holes: Mutex<Vec<Timestamp>>,
    /// Ranges the upstream gives up on
    pub timeouts: Mutex<Vec<TimeRange>>,
    /// Reported measurement frequency, 0 to echo the binsize
    pub frequency: Mutex<i64>,
    pub fail_history: AtomicBool,
    pub history_calls: Mutex<Vec<HistoryRequest>>,
    pub stream_calls: Mutex<Vec<StreamId>>,
    pub activity_calls: AtomicUsize,
    pub collection_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(streams: Vec<StreamRecord>) -> Self {
        let source = Self::default();
        *source.streams.lock() = streams;
        source
    }

    pub fn history_count(&self) -> usize {
        self.history_calls.lock().len()
    }

    pub fn last_history(&self) -> Option<HistoryRequest> {
        self.history_calls.lock().last().cloned()
    }
}

#[async_trait]
impl TimeSeriesSource for ScriptedSource {
    async fn request_collections(&self) -> Result<Vec<CollectionInfo>, SourceError> {
        self.collection_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            CollectionInfo {
                id: ICMP_ID,
                module: "amp".to_string(),
                modsubtype: "icmp".to_string(),
            },
            CollectionInfo {
                id: 9,
                module: "amp".to_string(),
                modsubtype: "dns".to_string(),
            },
        ])
    }

    async fn request_streams(
        &self,
        _collection: CollectionId,
        since: StreamId,
    ) -> Result<Vec<StreamRecord>, SourceError> {
        self.stream_calls.lock().push(since);
        Ok(self
            .streams
            .lock()
            .iter()
            .filter(|s| s.stream_id > since)
            .cloned()
            .collect())
    }

    async fn request_active_streams(
        &self,
        _collection: CollectionId,
        _since: Timestamp,
    ) -> Result<Vec<StreamId>, SourceError> {
        self.activity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.active.lock().clone())
    }

    async fn request_history(
        &self,
        request: &HistoryRequest,
    ) -> Result<BTreeMap<String, LabelHistory>, SourceError> {
        self.history_calls.lock().push(request.clone());
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(SourceError::Connection("connection refused".to_string()));
        }

        let holes = self.holes.lock().clone();
        let timeouts: Vec<TimeRange> = self
            .timeouts
            .lock()
            .iter()
            .filter(|t| t.start <= request.end && t.end > request.start)
            .copied()
            .collect();
        let configured = *self.frequency.lock();
        let frequency = if configured > 0 { configured } else { request.binsize };

        let mut response = BTreeMap::new();
        for (label, streams) in &request.labels {
            let mut data = Vec::new();
            let mut ts = request.start;
            while ts <= request.end {
                let lost = timeouts.iter().any(|t| t.contains(ts));
                if !holes.contains(&ts) && !lost {
                    data.push(
                        DataPoint::new(ts, ts + 3, Default::default())
                            .with_value("median", json!(ts as f64))
                            .with_value("results", json!(streams.len())),
                    );
                }
                ts += frequency;
            }

            response.insert(
                label.clone(),
                LabelHistory {
                    frequency,
                    data,
                    timed_out: timeouts.clone(),
                },
            );
        }
        Ok(response)
    }
}

/// An amp-icmp stream record
pub fn icmp_stream(
    id: StreamId,
    source: &str,
    destination: &str,
    address: &str,
    first: Timestamp,
    last: Timestamp,
) -> StreamRecord {
    serde_json::from_value(json!({
        "stream_id": id,
        "firsttimestamp": first,
        "lasttimestamp": last,
        "source": source,
        "destination": destination,
        "packet_size": "84",
        "address": address,
    }))
    .unwrap()
}

/// Configuration using the in-process cache
pub fn memory_config() -> Config {
    let mut config = Config::default();
    config.cache.backend = CacheBackendKind::Memory;
    config
}

/// Route library logs to the test harness, filtered by `RUST_LOG`
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}

/// Registry over a scripted source, an in-process cache and a fixed clock
pub fn registry(
    source: Arc<ScriptedSource>,
    now: Timestamp,
) -> (CollectionRegistry, Arc<LocalCache>, Arc<FixedClock>) {
    init_tracing();
    let cache = Arc::new(LocalCache::new(10_000));
    let clock = Arc::new(FixedClock::new(now));
    let registry = CollectionRegistry::new(source, cache.clone(), clock.clone(), memory_config());
    (registry, cache, clock)
}
