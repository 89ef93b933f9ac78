//! Striped concurrent hash map.
//!
//! Keys hash to one of [`SHARD_COUNT`] shards, each an `AHashMap` behind its
//! own `RwLock`, so operations on unrelated keys never serialize. Critical
//! sections are short (single map operations), and logical multi-key
//! atomicity is layered on top by [`crate::locks::LockTable`], not by
//! holding shard locks across commands.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::RwLock;

use ahash::{AHashMap, RandomState};

/// Number of stripes. Power of two so the modulo compiles to a mask.
const SHARD_COUNT: usize = 32;

/// A string-keyed map striped over independently locked shards.
pub struct Dict<V> {
    shards: Vec<RwLock<AHashMap<String, V>>>,
    hasher: RandomState,
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Dict<V> {
    /// Creates an empty dict.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(AHashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<AHashMap<String, V>> {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        &self.shards[(h.finish() as usize) % SHARD_COUNT]
    }

    /// Returns `true` if the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).read().expect("dict shard poisoned").contains_key(key)
    }

    /// Runs `f` over the value under a read lock.
    pub fn view<R>(&self, key: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        let shard = self.shard(key).read().expect("dict shard poisoned");
        shard.get(key).map(f)
    }

    /// Runs `f` over the value under a write lock. Does not create.
    pub fn modify<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut shard = self.shard(key).write().expect("dict shard poisoned");
        shard.get_mut(key).map(f)
    }

    /// Runs `f` over the value, inserting `default()` first when the key is
    /// absent. Returns `(result, inserted)`.
    pub fn modify_or_insert<R>(
        &self,
        key: &str,
        default: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> (R, bool) {
        let mut shard = self.shard(key).write().expect("dict shard poisoned");
        let mut inserted = false;
        let value = shard.entry(key.to_owned()).or_insert_with(|| {
            inserted = true;
            default()
        });
        (f(value), inserted)
    }

    /// Inserts or replaces, returning the previous value.
    pub fn insert(&self, key: &str, value: V) -> Option<V> {
        self.shard(key)
            .write()
            .expect("dict shard poisoned")
            .insert(key.to_owned(), value)
    }

    /// Inserts only when absent. Returns `true` on insert.
    pub fn insert_if_absent(&self, key: &str, value: V) -> bool {
        let mut shard = self.shard(key).write().expect("dict shard poisoned");
        if shard.contains_key(key) {
            false
        } else {
            shard.insert(key.to_owned(), value);
            true
        }
    }

    /// Replaces only when present. Returns `true` on replace.
    pub fn insert_if_present(&self, key: &str, value: V) -> bool {
        let mut shard = self.shard(key).write().expect("dict shard poisoned");
        match shard.get_mut(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Removes the key, returning its value.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard(key).write().expect("dict shard poisoned").remove(key)
    }

    /// Total entries across shards. Consistent per shard, approximate
    /// across them under concurrent writers.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("dict shard poisoned").len())
            .sum()
    }

    /// Returns `true` when every shard is empty.
    pub fn is_empty(&self) -> bool {
        self.shards
            .iter()
            .all(|s| s.read().expect("dict shard poisoned").is_empty())
    }

    /// Drops every entry, returning the removed values shard by shard.
    pub fn drain(&self) -> Vec<(String, V)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.write().expect("dict shard poisoned");
            out.extend(guard.drain());
        }
        out
    }

    /// Snapshot of all keys. Shard locks are taken one at a time.
    pub fn keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().expect("dict shard poisoned");
            out.extend(guard.keys().cloned());
        }
        out
    }

    /// Visits every entry shard by shard under read locks.
    pub fn for_each(&self, mut f: impl FnMut(&str, &V)) {
        for shard in &self.shards {
            let guard = shard.read().expect("dict shard poisoned");
            for (k, v) in guard.iter() {
                f(k, v);
            }
        }
    }
}

impl<V: Clone> Dict<V> {
    /// Clones out the value for `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.view(key, |v| v.clone())
    }
}
