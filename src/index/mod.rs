//! Stream index
//!
//! Hierarchical index from an ordered tuple of measurement properties to
//! stream ids, one per collection. Supports exact and wildcard lookups,
//! progressive drill-down selection and activity-window filtering.
//!
//! The index itself is not synchronized. Each collection wraps it in a
//! `parking_lot::RwLock`: lookups take the shared lock, the periodic
//! refresh takes the exclusive lock.
//!
//! # Example
//!
//! ```rust
//! use measure_cache::index::{SelectionQuery, StreamIndex};
//! use measure_cache::types::Properties;
//!
//! let mut index = StreamIndex::new(vec!["source".into(), "destination".into()]);
//!
//! let mut props = Properties::new();
//! props.insert("source".into(), "amp-a".into());
//! props.insert("destination".into(), "google.com".into());
//! index.add_stream(1, None, &props).unwrap();
//!
//! let page = index.find_selections(&SelectionQuery::new()).unwrap();
//! assert_eq!(page.key.as_deref(), Some("source"));
//! assert_eq!(page.total, 1);
//! ```

mod selection;
mod trie;

pub use selection::{SelectionItem, SelectionPage, SelectionQuery};
pub use trie::StreamEntry;

use std::collections::HashMap;

use tracing::debug;

use crate::error::IndexError;
use crate::types::{Properties, PropertyValue, StreamId, Timestamp};

use selection::paginate;
use trie::{lookup, Node, PropertyTrie};

/// First and last time a stream was seen producing data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityWindow {
    /// Earliest known measurement
    pub first: Timestamp,
    /// Latest known measurement
    pub last: Timestamp,
}

/// Multi-dimensional index over a fixed, ordered list of property keys
#[derive(Debug)]
pub struct StreamIndex {
    keys: Vec<String>,
    trie: PropertyTrie,
    properties: HashMap<StreamId, Properties>,
    activity: HashMap<StreamId, ActivityWindow>,
}

impl StreamIndex {
    /// Create an empty index branching on `keys`, in order
    pub fn new(keys: Vec<String>) -> Self {
        let depth = keys.len();
        Self {
            keys,
            trie: PropertyTrie::new(depth),
            properties: HashMap::new(),
            activity: HashMap::new(),
        }
    }

    /// Property keys the index branches on
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Number of indexed streams
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// True if no stream has been indexed
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Index a stream under its property tuple
    ///
    /// Every configured key must be present in `properties`. Adding an id
    /// a second time with the same tuple does nothing; adding it with a
    /// different tuple is rejected, since a stream has exactly one path.
    pub fn add_stream(
        &mut self,
        id: StreamId,
        payload: Option<serde_json::Value>,
        properties: &Properties,
    ) -> Result<(), IndexError> {
        let path = self.path_for(properties)?;

        if let Some(existing) = self.properties.get(&id) {
            if self.path_for(existing)? == path {
                return Ok(());
            }
            return Err(IndexError::DuplicateStream { id });
        }

        if !self.trie.insert(path, StreamEntry { id, payload }) {
            return Err(IndexError::MissingProperty {
                key: self.keys.last().cloned().unwrap_or_default(),
            });
        }
        self.properties.insert(id, properties.clone());
        Ok(())
    }

    fn path_for(&self, properties: &Properties) -> Result<Vec<PropertyValue>, IndexError> {
        self.keys
            .iter()
            .map(|key| {
                properties
                    .get(key)
                    .cloned()
                    .ok_or_else(|| IndexError::MissingProperty { key: key.clone() })
            })
            .collect()
    }

    /// Find every stream matching the given properties
    ///
    /// Keys absent from `partial` match any value. A value with no branch
    /// yields an empty result.
    pub fn find_streams(&self, partial: &Properties) -> Vec<StreamEntry> {
        let query: Vec<Option<&PropertyValue>> =
            self.keys.iter().map(|key| partial.get(key)).collect();
        self.trie.find(&query).into_iter().cloned().collect()
    }

    /// Stream ids matching the given properties
    pub fn find_stream_ids(&self, partial: &Properties) -> Vec<StreamId> {
        let query: Vec<Option<&PropertyValue>> =
            self.keys.iter().map(|key| partial.get(key)).collect();
        self.trie.find(&query).into_iter().map(|e| e.id).collect()
    }

    /// Properties a stream was indexed with
    pub fn find_stream_properties(&self, id: StreamId) -> Option<&Properties> {
        self.properties.get(&id)
    }

    /// Options for the first property key not fixed by `query.selected`
    ///
    /// Walks the selected values in key order and reports the distinct
    /// values one level below them, term-filtered, sorted and paginated.
    /// Once every key is selected the page has no key and no items.
    pub fn find_selections(&self, query: &SelectionQuery) -> Result<SelectionPage, IndexError> {
        let mut node = self.trie.root();

        for key in &self.keys {
            let children = match node {
                Node::Branch(children) => children,
                Node::Leaf(_) => break,
            };

            match query.selected.get(key) {
                Some(value) => match lookup(children, value) {
                    Some(child) => node = child,
                    None => {
                        return Err(IndexError::InvalidSelection {
                            key: key.clone(),
                            value: value.to_string(),
                        })
                    },
                },
                None => {
                    let options: Vec<SelectionItem> = children
                        .keys()
                        .map(SelectionItem::from_value)
                        .filter(|item| query.matches_term(&item.text))
                        .collect();
                    let total = options.len();
                    debug!(key = %key, total, "Enumerated selection options");

                    return Ok(SelectionPage {
                        key: Some(key.clone()),
                        total,
                        items: paginate(options, query.page, query.page_size),
                    });
                },
            }
        }

        Ok(SelectionPage::exhausted())
    }

    /// Record a measurement time for a stream, widening its activity window
    pub fn update_active_stream(&mut self, id: StreamId, timestamp: Timestamp) {
        self.activity
            .entry(id)
            .and_modify(|window| {
                window.last = window.last.max(timestamp);
                window.first = window.first.min(timestamp);
            })
            .or_insert(ActivityWindow {
                first: timestamp,
                last: timestamp,
            });
    }

    /// Activity window of a stream, if any measurement was recorded
    pub fn activity(&self, id: StreamId) -> Option<ActivityWindow> {
        self.activity.get(&id).copied()
    }

    /// Keep the ids whose activity window intersects `[start, end)`
    ///
    /// Ids with no recorded activity are kept.
    pub fn filter_active(&self, ids: &[StreamId], start: Timestamp, end: Timestamp) -> Vec<StreamId> {
        ids.iter()
            .copied()
            .filter(|id| match self.activity.get(id) {
                Some(window) => window.last > start && window.first < end,
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icmp_index() -> StreamIndex {
        StreamIndex::new(vec![
            "source".to_string(),
            "destination".to_string(),
            "packet_size".to_string(),
        ])
    }

    fn props(source: &str, destination: &str, size: &str) -> Properties {
        let mut p = Properties::new();
        p.insert("source".into(), source.into());
        p.insert("destination".into(), destination.into());
        p.insert("packet_size".into(), size.into());
        p
    }

    #[test]
    fn test_missing_property_rejected() {
        let mut index = icmp_index();
        let mut p = props("a", "b", "84");
        p.remove("packet_size");

        let err = index.add_stream(1, None, &p).unwrap_err();
        assert_eq!(
            err,
            IndexError::MissingProperty {
                key: "packet_size".to_string()
            }
        );
        assert!(index.is_empty());
    }

    #[test]
    fn test_duplicate_stream_handling() {
        let mut index = icmp_index();
        index.add_stream(1, None, &props("a", "b", "84")).unwrap();
        index.add_stream(1, None, &props("a", "b", "84")).unwrap();
        assert_eq!(index.find_stream_ids(&Properties::new()), vec![1]);

        let err = index.add_stream(1, None, &props("a", "c", "84")).unwrap_err();
        assert_eq!(err, IndexError::DuplicateStream { id: 1 });
    }

    #[test]
    fn test_find_streams_wildcards() {
        let mut index = icmp_index();
        index.add_stream(1, None, &props("a", "x", "84")).unwrap();
        index.add_stream(2, None, &props("a", "y", "84")).unwrap();
        index.add_stream(3, None, &props("b", "x", "1500")).unwrap();

        let mut query = Properties::new();
        query.insert("source".into(), "a".into());
        assert_eq!(index.find_stream_ids(&query), vec![1, 2]);

        let mut query = Properties::new();
        query.insert("destination".into(), "x".into());
        assert_eq!(index.find_stream_ids(&query), vec![1, 3]);

        query.insert("source".into(), "nowhere".into());
        assert!(index.find_streams(&query).is_empty());
    }

    #[test]
    fn test_selection_counts_distinct_values() {
        let mut index = StreamIndex::new(vec!["source".to_string()]);
        for (id, source) in [(1, "a"), (2, "b"), (3, "a")] {
            let mut p = Properties::new();
            p.insert("source".into(), source.into());
            index.add_stream(id, None, &p).unwrap();
        }

        let page = index.find_selections(&SelectionQuery::new()).unwrap();
        assert_eq!(page.key.as_deref(), Some("source"));
        assert_eq!(page.total, 2);
        let texts: Vec<_> = page.items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_selection_descends_and_paginates() {
        let mut index = icmp_index();
        for (id, dst) in ["d1", "d2", "d3", "e1"].iter().enumerate() {
            index.add_stream(id as u64, None, &props("a", dst, "84")).unwrap();
        }

        let query = SelectionQuery::new().select("source", "a").paginate(2, 2);
        let page = index.find_selections(&query).unwrap();
        assert_eq!(page.key.as_deref(), Some("destination"));
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].text, "d3");

        let query = SelectionQuery::new().select("source", "a").with_term("d");
        assert_eq!(index.find_selections(&query).unwrap().total, 3);

        let query = SelectionQuery::new()
            .select("source", "a")
            .select("destination", "d1")
            .select("packet_size", "84");
        assert_eq!(index.find_selections(&query).unwrap(), SelectionPage::exhausted());
    }

    #[test]
    fn test_invalid_selection() {
        let mut index = icmp_index();
        index.add_stream(1, None, &props("a", "b", "84")).unwrap();

        let query = SelectionQuery::new().select("source", "zz");
        assert!(matches!(
            index.find_selections(&query),
            Err(IndexError::InvalidSelection { .. })
        ));
    }

    #[test]
    fn test_filter_active() {
        let mut index = icmp_index();
        index.update_active_stream(1, 100);
        index.update_active_stream(1, 500);
        index.update_active_stream(2, 1000);

        assert_eq!(index.activity(1), Some(ActivityWindow { first: 100, last: 500 }));

        // 3 has no recorded activity and is kept
        assert_eq!(index.filter_active(&[1, 2, 3], 200, 600), vec![1, 3]);
        assert_eq!(index.filter_active(&[1, 2, 3], 500, 2000), vec![2, 3]);
    }

    #[test]
    fn test_find_stream_properties() {
        let mut index = icmp_index();
        index.add_stream(7, Some(serde_json::json!({"ttl": 4})), &props("a", "b", "84")).unwrap();

        let found = index.find_stream_properties(7).unwrap();
        assert_eq!(found.get("source"), Some(&PropertyValue::from("a")));
        assert!(index.find_stream_properties(8).is_none());
        assert!(index.find_streams(&Properties::new())[0].payload.is_some());
    }
}
