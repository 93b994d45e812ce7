//! Fixed-depth property trie
//!
//! Level `n` of the trie branches on the `n`th configured property key.
//! Leaves hold the streams that share the full property tuple.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{PropertyValue, StreamId};

/// A stream stored at a trie leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Upstream stream id
    pub id: StreamId,

    /// Optional adapter-specific data stored alongside the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug)]
pub(crate) enum Node {
    Branch(BTreeMap<PropertyValue, Node>),
    Leaf(Vec<StreamEntry>),
}

impl Node {
    fn for_depth(remaining: usize) -> Self {
        if remaining == 0 {
            Node::Leaf(Vec::new())
        } else {
            Node::Branch(BTreeMap::new())
        }
    }
}

/// Trie over an ordered property tuple
#[derive(Debug)]
pub(crate) struct PropertyTrie {
    root: Node,
    depth: usize,
}

impl PropertyTrie {
    pub fn new(depth: usize) -> Self {
        Self {
            root: Node::for_depth(depth),
            depth,
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Append `entry` under `path`, creating levels as needed
    ///
    /// Returns false if `path` does not match the trie depth.
    pub fn insert(&mut self, path: Vec<PropertyValue>, entry: StreamEntry) -> bool {
        if path.len() != self.depth {
            return false;
        }

        let depth = self.depth;
        let mut node = &mut self.root;
        for (level, value) in path.into_iter().enumerate() {
            let children = match node {
                Node::Branch(children) => children,
                Node::Leaf(_) => return false,
            };
            node = children
                .entry(value)
                .or_insert_with(|| Node::for_depth(depth - level - 1));
        }

        match node {
            Node::Leaf(entries) => {
                entries.push(entry);
                true
            },
            Node::Branch(_) => false,
        }
    }

    /// Collect every leaf entry matching `query`
    ///
    /// `None` at a level is a wildcard over all branches at that level.
    /// Entries come back in ascending property order.
    pub fn find(&self, query: &[Option<&PropertyValue>]) -> Vec<&StreamEntry> {
        let mut found = Vec::new();
        let mut stack: Vec<(&Node, usize)> = vec![(&self.root, 0)];

        while let Some((node, level)) = stack.pop() {
            match node {
                Node::Leaf(entries) => found.extend(entries.iter()),
                Node::Branch(children) => match query.get(level).copied().flatten() {
                    Some(value) => {
                        if let Some(child) = lookup(children, value) {
                            stack.push((child, level + 1));
                        }
                    },
                    None => {
                        for child in children.values().rev() {
                            stack.push((child, level + 1));
                        }
                    },
                },
            }
        }

        found
    }
}

/// Find the branch for `value`, accepting the string spelling of booleans
/// and integers since selections usually arrive as text
pub(crate) fn lookup<'a>(
    children: &'a BTreeMap<PropertyValue, Node>,
    value: &PropertyValue,
) -> Option<&'a Node> {
    if let Some(node) = children.get(value) {
        return Some(node);
    }

    match value {
        PropertyValue::Str(s) => match s.as_str() {
            "true" => children.get(&PropertyValue::Bool(true)),
            "false" => children.get(&PropertyValue::Bool(false)),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(|i| children.get(&PropertyValue::Int(i))),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: StreamId) -> StreamEntry {
        StreamEntry { id, payload: None }
    }

    #[test]
    fn test_insert_rejects_wrong_depth() {
        let mut trie = PropertyTrie::new(2);
        assert!(!trie.insert(vec!["a".into()], entry(1)));
        assert!(trie.insert(vec!["a".into(), "b".into()], entry(1)));
    }

    #[test]
    fn test_wildcard_fans_out_in_order() {
        let mut trie = PropertyTrie::new(2);
        trie.insert(vec!["b".into(), "x".into()], entry(3));
        trie.insert(vec!["a".into(), "y".into()], entry(2));
        trie.insert(vec!["a".into(), "x".into()], entry(1));

        let ids: Vec<_> = trie.find(&[None, None]).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let x = PropertyValue::from("x");
        let ids: Vec<_> = trie.find(&[None, Some(&x)]).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_lookup_coerces_text() {
        let mut trie = PropertyTrie::new(1);
        trie.insert(vec![PropertyValue::Bool(true)], entry(1));
        trie.insert(vec![PropertyValue::Int(53)], entry(2));

        let t = PropertyValue::from("true");
        let port = PropertyValue::from("53");
        assert_eq!(trie.find(&[Some(&t)])[0].id, 1);
        assert_eq!(trie.find(&[Some(&port)])[0].id, 2);
    }

    #[test]
    fn test_zero_depth_is_single_leaf() {
        let mut trie = PropertyTrie::new(0);
        assert!(trie.insert(vec![], entry(9)));
        assert_eq!(trie.find(&[]).len(), 1);
    }
}
