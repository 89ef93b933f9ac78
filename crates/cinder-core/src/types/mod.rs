//! Stored value representations.
//!
//! [`Entity`] is the tagged value a key maps to. Only one kind lives under a
//! key at a time; typed commands check the tag and fail with WRONGTYPE on a
//! mismatch.

pub mod quicklist;
pub mod sorted_set;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

pub use quicklist::QuickList;
pub use sorted_set::{AddOutcome, ScoreBound, SortedSet};

/// A value stored under a key.
#[derive(Debug, Clone)]
pub enum Entity {
    /// Binary-safe string. `Bytes` clones are cheap reference bumps.
    String(Bytes),
    /// Paged list with O(1) push/pop at both ends.
    List(QuickList),
    /// Field → value mapping.
    Hash(AHashMap<Bytes, Bytes>),
    /// Set of binary-safe members.
    Set(AHashSet<Bytes>),
    /// Score-ordered members.
    ZSet(SortedSet),
}

impl Entity {
    /// Type name as reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::String(_) => "string",
            Entity::List(_) => "list",
            Entity::Hash(_) => "hash",
            Entity::Set(_) => "set",
            Entity::ZSet(_) => "zset",
        }
    }
}

/// Resolves redis-style start/stop indices (negative counts from the end)
/// against a collection of `len` elements, producing a half-open `[lo, hi)`
/// window. An inverted or fully out-of-range request yields an empty window.
pub fn normalize_range(start: i64, stop: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    if len == 0 {
        return (0, 0);
    }

    let lo = if start < 0 { (len + start).max(0) } else { start };
    let hi = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if lo > hi || lo >= len || hi < 0 {
        return (0, 0);
    }
    (lo as usize, hi as usize + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!(Entity::String(Bytes::new()).type_name(), "string");
        assert_eq!(Entity::List(QuickList::new()).type_name(), "list");
        assert_eq!(Entity::Hash(AHashMap::new()).type_name(), "hash");
        assert_eq!(Entity::Set(AHashSet::new()).type_name(), "set");
        assert_eq!(Entity::ZSet(SortedSet::new()).type_name(), "zset");
    }

    #[test]
    fn normalize_positive() {
        assert_eq!(normalize_range(0, 2, 5), (0, 3));
        assert_eq!(normalize_range(1, 100, 5), (1, 5));
    }

    #[test]
    fn normalize_negative() {
        assert_eq!(normalize_range(0, -1, 5), (0, 5));
        assert_eq!(normalize_range(-3, -2, 5), (2, 4));
        assert_eq!(normalize_range(-100, -1, 5), (0, 5));
    }

    #[test]
    fn normalize_empty_cases() {
        assert_eq!(normalize_range(0, -1, 0), (0, 0));
        assert_eq!(normalize_range(3, 1, 5), (0, 0));
        assert_eq!(normalize_range(10, 20, 5), (0, 0));
        assert_eq!(normalize_range(0, -10, 5), (0, 0));
    }
}
