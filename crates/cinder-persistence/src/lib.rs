//! cinder-persistence: the append-only file.
//!
//! Mutating commands are logged as RESP multi-bulk frames, interleaved with
//! synthetic `SELECT <n>` frames whenever the database index changes. The
//! same wire format going to disk means recovery is just the protocol
//! parser pointed at a file.

pub mod aof;
pub mod replay;

pub use aof::{AofError, AofHandle, FsyncPolicy};
pub use replay::AofReplayer;
