//! Topology oracle: slot → owning node, node → address.
//!
//! Real deployments answer this from the raft-agreed cluster config; that
//! subsystem is an external collaborator. [`SeedTopology`] is the in-tree
//! implementation: a static membership list layered on the consistent-hash
//! ring, good for seed-node bootstrap and for tests.

use std::sync::RwLock;

use crate::ring::{HashRing, DEFAULT_REPLICAS};

/// Answers ownership questions for the router.
pub trait Topology: Send + Sync {
    /// This node's id (its announce address).
    fn self_id(&self) -> String;

    /// The node owning `slot`. Empty string when membership is empty.
    fn slot_owner(&self, slot: u32) -> String;

    /// Network address for a node id. Ids are announce addresses here, so
    /// this is the identity map for known members.
    fn node_addr(&self, node_id: &str) -> Option<String>;
}

/// Static membership over the hash ring. Slot owners are derived by
/// hashing the slot id onto the ring, which keeps assignment stable as
/// long as membership is.
pub struct SeedTopology {
    self_id: String,
    inner: RwLock<Inner>,
}

struct Inner {
    ring: HashRing,
    members: Vec<String>,
}

impl SeedTopology {
    /// Builds a topology over `members` (which must include `self_id`).
    pub fn new(self_id: String, members: Vec<String>) -> Self {
        let mut ring = HashRing::new(DEFAULT_REPLICAS);
        ring.add_nodes(&members);
        Self {
            self_id,
            inner: RwLock::new(Inner { ring, members }),
        }
    }

    /// Single-node topology: every slot owned by self.
    pub fn single(self_id: String) -> Self {
        let members = vec![self_id.clone()];
        Self::new(self_id, members)
    }

    /// Adds a member and rebuilds the ring.
    pub fn add_member(&self, node: String) {
        let mut inner = self.inner.write().expect("topology lock poisoned");
        if !inner.members.contains(&node) {
            inner.members.push(node.clone());
            inner.ring.add_nodes([node]);
        }
    }

    /// Current membership snapshot.
    pub fn members(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("topology lock poisoned")
            .members
            .clone()
    }
}

impl Topology for SeedTopology {
    fn self_id(&self) -> String {
        self.self_id.clone()
    }

    fn slot_owner(&self, slot: u32) -> String {
        self.inner
            .read()
            .expect("topology lock poisoned")
            .ring
            .pick_node(&format!("slot:{slot}"))
    }

    fn node_addr(&self, node_id: &str) -> Option<String> {
        let inner = self.inner.read().expect("topology lock poisoned");
        inner
            .members
            .iter()
            .any(|m| m == node_id)
            .then(|| node_id.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SLOT_COUNT;

    #[test]
    fn single_node_owns_all_slots() {
        let topo = SeedTopology::single("a:1".into());
        for slot in [0, 1, 100, SLOT_COUNT - 1] {
            assert_eq!(topo.slot_owner(slot), "a:1");
        }
    }

    #[test]
    fn owners_are_stable_and_spread() {
        let topo = SeedTopology::new(
            "a:1".into(),
            vec!["a:1".into(), "b:1".into(), "c:1".into()],
        );
        let mut seen = std::collections::HashSet::new();
        for slot in 0..SLOT_COUNT {
            let owner = topo.slot_owner(slot);
            assert_eq!(owner, topo.slot_owner(slot));
            seen.insert(owner);
        }
        assert_eq!(seen.len(), 3, "every member should own some slots");
    }

    #[test]
    fn node_addr_only_for_members() {
        let topo = SeedTopology::new("a:1".into(), vec!["a:1".into(), "b:1".into()]);
        assert_eq!(topo.node_addr("b:1"), Some("b:1".into()));
        assert_eq!(topo.node_addr("ghost:1"), None);
    }
}
