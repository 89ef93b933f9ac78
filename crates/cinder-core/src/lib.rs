//! cinder-core: the storage and execution engine.
//!
//! Owns the striped keyspace, the value types, command dispatch, the
//! MULTI/EXEC queue, the expiry time wheel, and the id generator. The
//! server crate drives it per connection; the cluster crate wraps it per
//! node.

pub mod client;
pub mod commands;
pub mod database;
pub mod dict;
pub mod engine;
pub mod idgen;
pub mod locks;
pub mod time;
pub mod timewheel;
mod tx;
pub mod types;

pub use client::ClientState;
pub use commands::CommandRegistry;
pub use database::{AofSink, Database, KeyEvents, TtlState};
pub use engine::{AofConfig, Engine, EngineConfig, EngineError};
pub use idgen::IdGenerator;
pub use timewheel::TimeWheel;
pub use types::Entity;
