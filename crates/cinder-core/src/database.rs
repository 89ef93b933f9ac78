//! A single logical database: key → entity plus key → expiry deadline.
//!
//! Both mappings are striped dicts, so unrelated keys never serialize.
//! Expired keys behave as absent on every access path and are removed
//! either lazily on touch or by the time-wheel job scheduled alongside the
//! deadline. Successful mutations fire the key-event callbacks registered
//! at construction; the cluster layer uses them to keep slot key-sets
//! current.

use std::sync::{Arc, RwLock, Weak};

use cinder_protocol::CmdLine;
use tracing::debug;

use crate::dict::Dict;
use crate::locks::LockTable;
use crate::time::{is_past, now_unix_ms, until};
use crate::timewheel::TimeWheel;
use crate::types::Entity;

/// Observer of keyspace insert/delete events.
///
/// One bundle is registered per engine at construction; callbacks run after
/// the store is updated, on the mutating caller's thread, and must be cheap.
pub trait KeyEvents: Send + Sync {
    fn key_inserted(&self, db_index: usize, key: &str);
    fn key_deleted(&self, db_index: usize, key: &str);
}

/// Sink for canonical AOF records emitted by command handlers.
pub type AofSink = Arc<dyn Fn(usize, &CmdLine) + Send + Sync>;

/// Result of a TTL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlState {
    /// Key does not exist (reported as -2).
    Absent,
    /// Key exists without an expiry (reported as -1).
    NoExpiry,
    /// Key expires in this many milliseconds.
    Remaining(u64),
}

/// One logical database.
pub struct Database {
    index: usize,
    data: Dict<Entity>,
    ttl: Dict<u64>,
    /// Logical multi-key lock table used by the command dispatcher.
    pub locks: LockTable,
    events: Option<Arc<dyn KeyEvents>>,
    aof: RwLock<Option<AofSink>>,
    wheel: TimeWheel,
    /// Self-handle so expire jobs can carry an owned reference into the
    /// wheel without a cycle.
    me: Weak<Database>,
}

impl Database {
    /// Creates database `index` sharing the engine's time wheel and
    /// callback bundle.
    pub fn new(index: usize, wheel: TimeWheel, events: Option<Arc<dyn KeyEvents>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            index,
            data: Dict::new(),
            ttl: Dict::new(),
            locks: LockTable::new(),
            events,
            aof: RwLock::new(None),
            wheel,
            me: me.clone(),
        })
    }

    /// This database's index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Installs the AOF sink. Done after replay so replayed commands do
    /// not re-append themselves.
    pub fn set_aof_sink(&self, sink: Option<AofSink>) {
        *self.aof.write().expect("aof sink lock poisoned") = sink;
    }

    /// Emits one canonical command record to the AOF, if enabled.
    pub fn add_aof(&self, line: CmdLine) {
        let sink = self.aof.read().expect("aof sink lock poisoned");
        if let Some(sink) = sink.as_ref() {
            sink(self.index, &line);
        }
    }

    fn fire_inserted(&self, key: &str) {
        if let Some(events) = &self.events {
            events.key_inserted(self.index, key);
        }
    }

    fn fire_deleted(&self, key: &str) {
        if let Some(events) = &self.events {
            events.key_deleted(self.index, key);
        }
    }

    fn expire_task_name(&self, key: &str) -> String {
        format!("expire:{}:{}", self.index, key)
    }

    /// Removes `key` if its deadline has passed. Returns `true` if the key
    /// was reaped.
    pub fn expire_if_needed(&self, key: &str) -> bool {
        match self.ttl.get(key) {
            Some(deadline) if is_past(deadline) => {
                self.remove_reaped(key);
                true
            }
            _ => false,
        }
    }

    /// Removal driven by expiry (lazy or wheel): same cleanup as
    /// [`Database::remove`] minus the redundant deadline check.
    fn remove_reaped(&self, key: &str) {
        self.ttl.remove(key);
        self.wheel.cancel(&self.expire_task_name(key));
        if self.data.remove(key).is_some() {
            self.fire_deleted(key);
        }
    }

    /// Returns a clone of the entity, treating expired keys as absent.
    pub fn get(&self, key: &str) -> Option<Entity> {
        self.expire_if_needed(key);
        self.data.get(key)
    }

    /// Read-only access to the entity under the dict's shard lock.
    pub fn view<R>(&self, key: &str, f: impl FnOnce(&Entity) -> R) -> Option<R> {
        self.expire_if_needed(key);
        self.data.view(key, f)
    }

    /// In-place mutation of an existing entity.
    pub fn modify<R>(&self, key: &str, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        self.expire_if_needed(key);
        self.data.modify(key, f)
    }

    /// In-place mutation, creating the entity via `default` when the key is
    /// absent. Fires the insert callback for creations.
    pub fn modify_or_insert<R>(
        &self,
        key: &str,
        default: impl FnOnce() -> Entity,
        f: impl FnOnce(&mut Entity) -> R,
    ) -> R {
        self.expire_if_needed(key);
        let (result, inserted) = self.data.modify_or_insert(key, default, f);
        if inserted {
            self.fire_inserted(key);
        }
        result
    }

    /// Inserts or replaces and cancels any existing expiry.
    pub fn put(&self, key: &str, entity: Entity) {
        self.data.insert(key, entity);
        self.clear_ttl(key);
        self.fire_inserted(key);
    }

    /// Inserts or replaces, leaving any existing expiry in place (SET
    /// KEEPTTL path).
    pub fn put_keep_ttl(&self, key: &str, entity: Entity) {
        self.expire_if_needed(key);
        self.data.insert(key, entity);
        self.fire_inserted(key);
    }

    /// Inserts only when the key is absent (expired counts as absent).
    pub fn put_if_absent(&self, key: &str, entity: Entity) -> bool {
        self.expire_if_needed(key);
        let stored = self.data.insert_if_absent(key, entity);
        if stored {
            self.fire_inserted(key);
        }
        stored
    }

    /// Replaces only when the key is present.
    pub fn put_if_exists(&self, key: &str, entity: Entity) -> bool {
        self.expire_if_needed(key);
        let stored = self.data.insert_if_present(key, entity);
        if stored {
            self.fire_inserted(key);
        }
        stored
    }

    /// Removes the key, its deadline, and its wheel job. Returns `true` if
    /// a live key was removed.
    pub fn remove(&self, key: &str) -> bool {
        self.expire_if_needed(key);
        self.ttl.remove(key);
        self.wheel.cancel(&self.expire_task_name(key));
        match self.data.remove(key) {
            Some(_) => {
                self.fire_deleted(key);
                true
            }
            None => false,
        }
    }

    /// Returns `true` when the key exists and is not expired.
    pub fn exists(&self, key: &str) -> bool {
        self.expire_if_needed(key);
        self.data.contains(key)
    }

    /// Sets an absolute expiry deadline and schedules the wheel job that
    /// reaps the key. Keys without data are ignored (TTL never dangles).
    pub fn expire_at(&self, key: &str, deadline_ms: u64) -> bool {
        self.expire_if_needed(key);
        if !self.data.contains(key) {
            return false;
        }
        self.ttl.insert(key, deadline_ms);

        let db = self.me.upgrade().expect("database alive while in use");
        let owned_key = key.to_owned();
        self.wheel.schedule(
            self.expire_task_name(key),
            until(deadline_ms),
            Box::new(move || {
                // deadline may have been replaced or removed since this job
                // was scheduled
                let _guard = db.locks.lock_write(&owned_key);
                match db.ttl.get(&owned_key) {
                    Some(current) if current == deadline_ms && is_past(current) => {
                        debug!(key = %owned_key, "key expired");
                        db.remove_reaped(&owned_key);
                    }
                    _ => {}
                }
            }),
        );
        true
    }

    /// Drops the expiry, keeping the key. Returns `true` if a deadline
    /// existed.
    pub fn persist(&self, key: &str) -> bool {
        self.expire_if_needed(key);
        let had = self.ttl.remove(key).is_some();
        if had {
            self.wheel.cancel(&self.expire_task_name(key));
        }
        had
    }

    fn clear_ttl(&self, key: &str) {
        if self.ttl.remove(key).is_some() {
            self.wheel.cancel(&self.expire_task_name(key));
        }
    }

    /// TTL query with redis semantics.
    pub fn ttl_state(&self, key: &str) -> TtlState {
        self.expire_if_needed(key);
        if !self.data.contains(key) {
            return TtlState::Absent;
        }
        match self.ttl.get(key) {
            None => TtlState::NoExpiry,
            Some(deadline) => TtlState::Remaining(deadline.saturating_sub(now_unix_ms())),
        }
    }

    /// Raw deadline in unix ms, if set. Used by AOF rewrite.
    pub fn deadline_ms(&self, key: &str) -> Option<u64> {
        self.ttl.get(key)
    }

    /// Number of stored keys. Stale expired entries are counted until
    /// reaped, matching lazy-expiry semantics.
    pub fn key_count(&self) -> usize {
        self.data.len()
    }

    /// Snapshot of live (non-expired) keys.
    pub fn keys(&self) -> Vec<String> {
        let now = now_unix_ms();
        self.data
            .keys()
            .into_iter()
            .filter(|k| match self.ttl.get(k) {
                Some(deadline) => deadline > now,
                None => true,
            })
            .collect()
    }

    /// Visits every live entry. Shard locks are held one shard at a time;
    /// used by AOF rewrite and KEYS.
    pub fn for_each_entity(&self, mut f: impl FnMut(&str, &Entity)) {
        let now = now_unix_ms();
        self.data.for_each(|k, v| {
            let live = match self.ttl.get(k) {
                Some(deadline) => deadline > now,
                None => true,
            };
            if live {
                f(k, v);
            }
        });
    }

    /// Drops every key and cancels every expire job.
    pub fn flush(&self) {
        for (key, _) in self.ttl.drain() {
            self.wheel.cancel(&self.expire_task_name(&key));
        }
        for (key, _) in self.data.drain() {
            self.fire_deleted(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timewheel::{TimeWheel, DEFAULT_BUCKETS};
    use ahash::AHashSet;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_db() -> Arc<Database> {
        let wheel = TimeWheel::start(Duration::from_millis(10), DEFAULT_BUCKETS);
        Database::new(0, wheel, None)
    }

    fn s(data: &str) -> Entity {
        Entity::String(Bytes::copy_from_slice(data.as_bytes()))
    }

    #[tokio::test]
    async fn put_get_remove() {
        let db = test_db();
        db.put("k", s("v"));
        assert!(db.exists("k"));
        assert!(matches!(db.get("k"), Some(Entity::String(b)) if &b[..] == b"v"));
        assert!(db.remove("k"));
        assert!(!db.remove("k"));
        assert_eq!(db.key_count(), 0);
    }

    #[tokio::test]
    async fn conditional_puts() {
        let db = test_db();
        assert!(db.put_if_absent("k", s("1")));
        assert!(!db.put_if_absent("k", s("2")));
        assert!(db.put_if_exists("k", s("3")));
        assert!(!db.put_if_exists("nope", s("x")));
        assert!(matches!(db.get("k"), Some(Entity::String(b)) if &b[..] == b"3"));
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let db = test_db();
        db.put("k", s("v"));
        db.expire_at("k", now_unix_ms().saturating_sub(1));
        assert!(db.get("k").is_none());
        assert!(!db.exists("k"));
        assert_eq!(db.ttl_state("k"), TtlState::Absent);
        // lazy reap removed it from the store
        assert_eq!(db.key_count(), 0);
    }

    #[tokio::test]
    async fn wheel_reaps_without_access() {
        let db = test_db();
        db.put("k", s("v"));
        db.expire_at("k", now_unix_ms() + 50);
        tokio::time::sleep(Duration::from_millis(300)).await;
        // no read of "k" has happened; the wheel job removed it
        assert_eq!(db.key_count(), 0);
    }

    #[tokio::test]
    async fn persist_keeps_the_key() {
        let db = test_db();
        db.put("k", s("v"));
        db.expire_at("k", now_unix_ms() + 50);
        assert!(db.persist("k"));
        assert!(!db.persist("k"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(db.exists("k"));
        assert_eq!(db.ttl_state("k"), TtlState::NoExpiry);
    }

    #[tokio::test]
    async fn put_clears_ttl_but_keep_ttl_does_not() {
        let db = test_db();
        db.put("k", s("v"));
        db.expire_at("k", now_unix_ms() + 60_000);
        db.put("k", s("w"));
        assert_eq!(db.ttl_state("k"), TtlState::NoExpiry);

        db.expire_at("k", now_unix_ms() + 60_000);
        db.put_keep_ttl("k", s("x"));
        assert!(matches!(db.ttl_state("k"), TtlState::Remaining(_)));
    }

    #[tokio::test]
    async fn expire_on_missing_key_is_rejected() {
        let db = test_db();
        assert!(!db.expire_at("ghost", now_unix_ms() + 1000));
        assert_eq!(db.ttl_state("ghost"), TtlState::Absent);
    }

    #[tokio::test]
    async fn flush_removes_keys_and_jobs() {
        let db = test_db();
        for i in 0..20 {
            db.put(&format!("k{i}"), s("v"));
        }
        db.expire_at("k0", now_unix_ms() + 50);
        db.flush();
        assert_eq!(db.key_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(db.key_count(), 0);
    }

    struct Recorder {
        inserted: Mutex<AHashSet<String>>,
        deleted: Mutex<AHashSet<String>>,
    }

    impl KeyEvents for Recorder {
        fn key_inserted(&self, _db: usize, key: &str) {
            self.inserted.lock().unwrap().insert(key.to_owned());
        }
        fn key_deleted(&self, _db: usize, key: &str) {
            self.deleted.lock().unwrap().insert(key.to_owned());
        }
    }

    #[tokio::test]
    async fn callbacks_fire_after_mutation() {
        let recorder = Arc::new(Recorder {
            inserted: Mutex::new(AHashSet::new()),
            deleted: Mutex::new(AHashSet::new()),
        });
        let wheel = TimeWheel::start(Duration::from_millis(10), 64);
        let db = Database::new(0, wheel, Some(Arc::clone(&recorder) as Arc<dyn KeyEvents>));

        db.put("a", s("1"));
        db.modify_or_insert("b", || Entity::List(Default::default()), |_| ());
        db.remove("a");

        assert!(recorder.inserted.lock().unwrap().contains("a"));
        assert!(recorder.inserted.lock().unwrap().contains("b"));
        assert!(recorder.deleted.lock().unwrap().contains("a"));
        assert!(!recorder.deleted.lock().unwrap().contains("b"));
    }

    #[tokio::test]
    async fn keys_filters_expired() {
        let db = test_db();
        db.put("live", s("1"));
        db.put("dead", s("2"));
        db.expire_at("dead", now_unix_ms().saturating_sub(1));
        let keys = db.keys();
        assert_eq!(keys, vec!["live".to_owned()]);
    }
}
