//! Slot table: which of the 16384 slots this node hosts, and in what state.
//!
//! Each hosted slot tracks its key set (kept current by keyspace
//! callbacks) behind its own lock. The outer map lock is held only long
//! enough to clone out the slot handle, never across a slot-lock
//! acquisition.

use std::sync::{Arc, RwLock};

use ahash::{AHashMap, AHashSet};
use cinder_core::KeyEvents;
use tracing::info;

use crate::ring::partition_key;

/// Total slots, fixed by the wire contract.
pub const SLOT_COUNT: u32 = 16384;

/// Computes the slot a key belongs to.
pub fn key_slot(key: &str) -> u32 {
    crc32fast::hash(partition_key(key).as_bytes()) % SLOT_COUNT
}

/// Lifecycle state of a locally hosted slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Steady state: this node serves reads and writes.
    Hosted,
    /// Keys are being pulled from `old_node`; writes land here, reads of
    /// not-yet-imported keys fetch from the old owner first.
    Importing,
    /// Slot is leaving: reads serve locally, writes forward to `new_node`.
    MovingOut,
}

/// One hosted slot.
#[derive(Debug)]
pub struct HostSlot {
    pub state: SlotState,
    /// Live keys in this slot.
    pub keys: AHashSet<String>,
    /// Keys already pulled from the old owner while importing. A deleted
    /// key stays in this set so deletion is distinguishable from
    /// not-yet-migrated.
    pub imported_keys: AHashSet<String>,
    /// Previous owner; only meaningful while importing.
    pub old_node: String,
    /// Next owner; only meaningful while moving out.
    pub new_node: String,
}

impl HostSlot {
    fn hosted() -> Self {
        Self {
            state: SlotState::Hosted,
            keys: AHashSet::new(),
            imported_keys: AHashSet::new(),
            old_node: String::new(),
            new_node: String::new(),
        }
    }
}

/// All slots this node currently hosts.
#[derive(Default)]
pub struct SlotTable {
    slots: RwLock<AHashMap<u32, Arc<RwLock<HostSlot>>>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones out the handle for `slot`, if hosted.
    pub fn slot(&self, slot: u32) -> Option<Arc<RwLock<HostSlot>>> {
        self.slots
            .read()
            .expect("slot map lock poisoned")
            .get(&slot)
            .cloned()
    }

    /// Returns `true` when this node hosts `slot` in any state.
    pub fn hosts(&self, slot: u32) -> bool {
        self.slots
            .read()
            .expect("slot map lock poisoned")
            .contains_key(&slot)
    }

    /// Registers `slot` as hosted (steady state). Idempotent.
    pub fn host(&self, slot: u32) {
        self.slots
            .write()
            .expect("slot map lock poisoned")
            .entry(slot)
            .or_insert_with(|| Arc::new(RwLock::new(HostSlot::hosted())));
    }

    /// `(none) → Importing`: begin pulling the slot from `old_node`.
    pub fn start_import(&self, slot: u32, old_node: &str) {
        let mut slots = self.slots.write().expect("slot map lock poisoned");
        let entry = slots
            .entry(slot)
            .or_insert_with(|| Arc::new(RwLock::new(HostSlot::hosted())));
        let mut host = entry.write().expect("slot lock poisoned");
        host.state = SlotState::Importing;
        host.old_node = old_node.to_owned();
        host.new_node.clear();
        host.imported_keys.clear();
        info!(slot, old_node, "slot import started");
    }

    /// `Importing → Hosted`: every key has been pulled.
    pub fn finish_import(&self, slot: u32) {
        if let Some(entry) = self.slot(slot) {
            let mut host = entry.write().expect("slot lock poisoned");
            if host.state == SlotState::Importing {
                host.state = SlotState::Hosted;
                host.old_node.clear();
                host.imported_keys.clear();
                info!(slot, "slot import finished");
            }
        }
    }

    /// `Hosted → MovingOut`: the slot is being handed to `new_node`.
    pub fn start_export(&self, slot: u32, new_node: &str) {
        if let Some(entry) = self.slot(slot) {
            let mut host = entry.write().expect("slot lock poisoned");
            if host.state == SlotState::Hosted {
                host.state = SlotState::MovingOut;
                host.new_node = new_node.to_owned();
                info!(slot, new_node, "slot export started");
            }
        }
    }

    /// `MovingOut → (removed)`: the new owner has everything.
    pub fn finish_export(&self, slot: u32) {
        let removed = self
            .slots
            .write()
            .expect("slot map lock poisoned")
            .remove(&slot);
        if removed.is_some() {
            info!(slot, "slot export finished");
        }
    }

    /// Number of hosted slots.
    pub fn hosted_count(&self) -> usize {
        self.slots.read().expect("slot map lock poisoned").len()
    }

    /// Snapshot of the keys currently recorded in `slot`.
    pub fn keys_in_slot(&self, slot: u32) -> Vec<String> {
        match self.slot(slot) {
            Some(entry) => {
                let host = entry.read().expect("slot lock poisoned");
                host.keys.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

/// Keyspace callbacks keep slot key-sets current regardless of slot state.
impl KeyEvents for SlotTable {
    fn key_inserted(&self, _db_index: usize, key: &str) {
        if let Some(entry) = self.slot(key_slot(key)) {
            let mut host = entry.write().expect("slot lock poisoned");
            host.keys.insert(key.to_owned());
        }
    }

    fn key_deleted(&self, _db_index: usize, key: &str) {
        if let Some(entry) = self.slot(key_slot(key)) {
            let mut host = entry.write().expect("slot lock poisoned");
            host.keys.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_slot_is_stable_and_in_range() {
        for key in ["a", "user:1000", "{tag}x", "", "longer-key-name"] {
            let slot = key_slot(key);
            assert!(slot < SLOT_COUNT);
            assert_eq!(slot, key_slot(key));
        }
    }

    #[test]
    fn hash_tag_collapses_slots() {
        assert_eq!(key_slot("{user1}:a"), key_slot("{user1}:b"));
        assert_eq!(key_slot("x{t}"), key_slot("y{t}"));
    }

    #[test]
    fn hosted_lifecycle() {
        let table = SlotTable::new();
        assert!(!table.hosts(7));
        table.host(7);
        assert!(table.hosts(7));
        let entry = table.slot(7).unwrap();
        assert_eq!(entry.read().unwrap().state, SlotState::Hosted);
    }

    #[test]
    fn import_transitions() {
        let table = SlotTable::new();
        table.start_import(9, "old:6399");
        {
            let entry = table.slot(9).unwrap();
            let host = entry.read().unwrap();
            assert_eq!(host.state, SlotState::Importing);
            assert_eq!(host.old_node, "old:6399");
        }
        table.finish_import(9);
        let entry = table.slot(9).unwrap();
        let host = entry.read().unwrap();
        assert_eq!(host.state, SlotState::Hosted);
        assert!(host.old_node.is_empty());
    }

    #[test]
    fn export_transitions_and_removal() {
        let table = SlotTable::new();
        table.host(3);
        table.start_export(3, "new:6399");
        {
            let entry = table.slot(3).unwrap();
            assert_eq!(entry.read().unwrap().state, SlotState::MovingOut);
        }
        table.finish_export(3);
        assert!(!table.hosts(3));
    }

    #[test]
    fn export_requires_hosted_state() {
        let table = SlotTable::new();
        table.start_import(5, "old:6399");
        table.start_export(5, "new:6399");
        let entry = table.slot(5).unwrap();
        // still importing: the transition was refused
        assert_eq!(entry.read().unwrap().state, SlotState::Importing);
    }

    #[test]
    fn key_events_maintain_slot_sets() {
        let table = SlotTable::new();
        let slot = key_slot("watched");
        table.host(slot);

        table.key_inserted(0, "watched");
        assert_eq!(table.keys_in_slot(slot), vec!["watched".to_owned()]);

        table.key_deleted(0, "watched");
        assert!(table.keys_in_slot(slot).is_empty());

        // events for slots we don't host are ignored
        table.key_inserted(0, "some-other-key-entirely");
    }
}
