//! cinder-cluster: the sharding layer.
//!
//! Maps keys to one of 16384 slots, routes each request to the owning
//! node (executing locally or forwarding through pooled peer clients),
//! tracks per-slot migration state, and coordinates cross-node multi-key
//! commands with a best-effort try-confirm-cancel round. Topology
//! agreement itself (raft) is an external collaborator behind the
//! [`Topology`] trait.

pub mod dump;
pub mod error;
pub mod node;
pub mod pool;
pub mod ring;
pub mod slots;
pub mod topology;

pub use error::ClusterError;
pub use node::{ClusterConfig, ClusterNode};
pub use ring::{partition_key, HashRing};
pub use slots::{key_slot, SlotState, SlotTable, SLOT_COUNT};
pub use topology::{SeedTopology, Topology};
