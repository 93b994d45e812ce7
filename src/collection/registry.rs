//! Collection registry
//!
//! Owns everything collections share: the upstream source, the cache
//! backend, the clock and the configuration. Collections are built the
//! first time they are asked for, using the adapter registered under
//! their name, and live for the lifetime of the registry.
//!
//! # Example
//!
//! ```rust,no_run
//! use measure_cache::collection::CollectionRegistry;
//! use measure_cache::config::Config;
//! use measure_cache::reconcile::HistoryQuery;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CollectionRegistry::connect(Config::from_env()).await?;
//! let labels = registry
//!     .labels_for_groups("amp-icmp", &[(1, "FROM amp-a TO amp-b OPTION 84 FAMILY".to_string())])
//!     .await?;
//! let query = HistoryQuery::new(labels, 1_700_000_000, 1_700_086_400, "full");
//! let history = registry.history("amp-icmp", &query).await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{AmpIcmp, Collection, CollectionAdapter};
use crate::cache::{BlockCache, CacheBackend, LocalCache};
use crate::config::{CacheBackendKind, Config};
use crate::error::{CollectionError, Result};
use crate::metrics;
use crate::reconcile::{HistoryQuery, HistoryResult, RecentResult};
use crate::redis::{RedisCacheBackend, RedisConfig};
use crate::source::{CollectionId, TimeSeriesSource, UpstreamClient};
use crate::types::{Clock, Label, SystemClock};

/// Entry point for the serving layer
pub struct CollectionRegistry {
    source: Arc<dyn TimeSeriesSource>,
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    config: Config,
    adapters: RwLock<HashMap<String, Arc<dyn CollectionAdapter>>>,
    ids: RwLock<HashMap<String, CollectionId>>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl CollectionRegistry {
    /// Create a registry with the built-in adapters registered
    pub fn new(
        source: Arc<dyn TimeSeriesSource>,
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        let registry = Self {
            source,
            backend,
            clock,
            config,
            adapters: RwLock::new(HashMap::new()),
            ids: RwLock::new(HashMap::new()),
            collections: RwLock::new(HashMap::new()),
        };
        registry.register_adapter(Arc::new(AmpIcmp));
        registry
    }

    /// Build the upstream client and cache backend described by `config`
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;

        if config.monitoring.metrics_enabled {
            metrics::init();
        }

        let backend: Arc<dyn CacheBackend> = match config.cache.backend {
            CacheBackendKind::Redis => {
                let redis = RedisConfig::from_cache_config(&config.cache);
                Arc::new(RedisCacheBackend::connect(redis).await?)
            },
            CacheBackendKind::Memory => Arc::new(LocalCache::new(config.cache.local_max_entries)),
        };
        let source = Arc::new(UpstreamClient::new(&config.upstream));

        info!(
            upstream = %source.address(),
            backend = backend.name(),
            "Collection registry ready"
        );

        Ok(Self::new(source, backend, Arc::new(SystemClock), config))
    }

    /// Make an adapter available under its collection name
    pub fn register_adapter(&self, adapter: Arc<dyn CollectionAdapter>) {
        self.adapters
            .write()
            .insert(adapter.name().to_string(), adapter);
    }

    /// Ask the upstream which collections exist
    ///
    /// Returns the number of collections known afterwards.
    pub async fn refresh_collections(&self) -> Result<usize> {
        let collections = self.source.request_collections().await?;

        let mut ids = self.ids.write();
        for info in collections {
            ids.insert(info.name(), info.id);
        }
        info!(collections = ids.len(), "Refreshed collection list");
        Ok(ids.len())
    }

    /// The collection called `name`, refreshed from the upstream if due
    pub async fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        let existing = self.collections.read().get(name).cloned();
        let collection = match existing {
            Some(collection) => collection,
            None => self.build(name).await?,
        };

        collection.update_streams(self.source.as_ref()).await?;
        Ok(collection)
    }

    async fn build(&self, name: &str) -> Result<Arc<Collection>> {
        let adapter = self
            .adapters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CollectionError::UnknownCollection(name.to_string()))?;

        let known = self.ids.read().get(name).copied();
        let id = match known {
            Some(id) => id,
            None => {
                self.refresh_collections().await?;
                self.ids
                    .read()
                    .get(name)
                    .copied()
                    .ok_or_else(|| CollectionError::UnknownCollection(name.to_string()))?
            },
        };

        let cache = BlockCache::new(
            Arc::clone(&self.backend),
            name,
            &self.config.cache,
            Arc::clone(&self.clock),
        );
        let built = Arc::new(Collection::new(
            id,
            adapter,
            cache,
            Arc::clone(&self.clock),
            self.config.index.clone(),
            self.config.query.clone(),
        ));

        // Another task may have built it meanwhile; keep the first
        let mut collections = self.collections.write();
        let collection = collections
            .entry(name.to_string())
            .or_insert(built)
            .clone();
        Ok(collection)
    }

    /// Resolve saved groups of a collection into labels
    pub async fn labels_for_groups(
        &self,
        name: &str,
        groups: &[(i64, String)],
    ) -> Result<Vec<Label>> {
        let collection = self.collection(name).await?;
        let mut labels = Vec::new();
        for (group_id, description) in groups {
            labels.extend(collection.group_to_labels(*group_id, description)?);
        }
        Ok(labels)
    }

    /// Gap-filled history for a collection
    pub async fn history(&self, name: &str, query: &HistoryQuery) -> Result<HistoryResult> {
        let collection = self.collection(name).await?;
        collection.history(self.source.as_ref(), query).await
    }

    /// Last `duration` seconds of a collection
    pub async fn recent(
        &self,
        name: &str,
        labels: &[Label],
        duration: i64,
        detail: &str,
    ) -> Result<RecentResult> {
        let collection = self.collection(name).await?;
        collection
            .recent(self.source.as_ref(), labels, duration, detail)
            .await
    }
}
