//! Consistent-hash ring with virtual nodes.
//!
//! Each physical node contributes `replicas` hash points (`crc32("<i><node>")`
//! for i in 0..replicas). Lookup hashes the key's partition key (the hash
//! tag when the key carries one) and binary-searches the sorted point list
//! for the first point at or past it, wrapping to the start.

use ahash::AHashMap;

/// Default virtual nodes per physical node.
pub const DEFAULT_REPLICAS: usize = 16;

/// A consistent-hash ring mapping keys to node names.
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    /// Sorted hash points.
    points: Vec<u32>,
    /// Hash point → node name.
    nodes: AHashMap<u32, String>,
}

impl HashRing {
    /// Creates an empty ring with `replicas` virtual nodes per entry.
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: Vec::new(),
            nodes: AHashMap::new(),
        }
    }

    /// Returns `true` when the ring holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Adds nodes, rebuilding the sorted point list. Empty names are
    /// skipped.
    pub fn add_nodes<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let name = name.as_ref();
            if name.is_empty() {
                continue;
            }
            for i in 0..self.replicas {
                let point = crc32fast::hash(format!("{i}{name}").as_bytes());
                if !self.nodes.contains_key(&point) {
                    self.points.push(point);
                }
                self.nodes.insert(point, name.to_owned());
            }
        }
        self.points.sort_unstable();
    }

    /// Removes a node's points, rebuilding the sorted list.
    pub fn remove_node(&mut self, name: &str) {
        for i in 0..self.replicas {
            let point = crc32fast::hash(format!("{i}{name}").as_bytes());
            if self.nodes.get(&point).map(String::as_str) == Some(name) {
                self.nodes.remove(&point);
            }
        }
        self.points.retain(|p| self.nodes.contains_key(p));
    }

    /// Picks the node owning `key`. Returns the empty string on an empty
    /// ring.
    pub fn pick_node(&self, key: &str) -> String {
        if self.is_empty() {
            return String::new();
        }
        let hash = crc32fast::hash(partition_key(key).as_bytes());
        let idx = match self.points.binary_search(&hash) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0, // wrap
            Err(i) => i,
        };
        self.nodes[&self.points[idx]].clone()
    }
}

/// The hashable portion of a key: the hash tag between the first `{` and
/// the next `}` when non-empty, otherwise the whole key. Related keys use
/// tags to land on one node.
pub fn partition_key(key: &str) -> &str {
    let Some(open) = key.find('{') else {
        return key;
    };
    let rest = &key[open + 1..];
    let Some(close) = rest.find('}') else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &rest[..close]
}
