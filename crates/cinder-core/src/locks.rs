//! Ordered multi-key lock table.
//!
//! Commands that touch several keys (MSET, EXEC, SINTER across keys) need
//! logical atomicity beyond the dict's per-shard stripes. The table maps
//! keys onto a fixed array of RwLocks; a single [`LockTable::lock`] call
//! acquires every needed stripe in ascending index order, which makes
//! deadlock between concurrent multi-key commands impossible. A key needed
//! for both reading and writing takes the write lock.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::RandomState;

/// Number of lock stripes. More stripes, less false sharing between
/// unrelated keys.
const STRIPE_COUNT: usize = 128;

/// A fixed pool of RwLocks that keys hash onto.
pub struct LockTable {
    stripes: Vec<RwLock<()>>,
    hasher: RandomState,
}

/// Guard holding every stripe a command needs. Locks release in drop order,
/// which is the reverse of acquisition.
pub struct LockGuard<'a> {
    #[allow(dead_code)]
    guards: Vec<StripeGuard<'a>>,
}

enum StripeGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    /// Creates a table with the default stripe count.
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| RwLock::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn stripe_of(&self, key: &[u8]) -> usize {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        (h.finish() as usize) % STRIPE_COUNT
    }

    /// Acquires the stripes covering `write_keys` (exclusive) and
    /// `read_keys` (shared), in ascending stripe order.
    pub fn lock<'a, K: AsRef<[u8]>>(
        &'a self,
        write_keys: &[K],
        read_keys: &[K],
    ) -> LockGuard<'a> {
        // (stripe index, wants write); write wins when both sides hit
        // the same stripe
        let mut wanted: Vec<(usize, bool)> = Vec::with_capacity(write_keys.len() + read_keys.len());
        for k in write_keys {
            wanted.push((self.stripe_of(k.as_ref()), true));
        }
        for k in read_keys {
            wanted.push((self.stripe_of(k.as_ref()), false));
        }
        wanted.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        wanted.dedup_by_key(|(idx, _)| *idx);

        let guards = wanted
            .into_iter()
            .map(|(idx, write)| {
                let stripe = &self.stripes[idx];
                if write {
                    StripeGuard::Write(stripe.write().expect("lock stripe poisoned"))
                } else {
                    StripeGuard::Read(stripe.read().expect("lock stripe poisoned"))
                }
            })
            .collect();

        LockGuard { guards }
    }

    /// Shorthand: exclusive lock over one key.
    pub fn lock_write<'a>(&'a self, key: &str) -> LockGuard<'a> {
        self.lock(&[key], &[])
    }
}
