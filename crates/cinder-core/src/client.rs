//! Per-client connection state.
//!
//! Owned mutably by the connection driver and threaded through every
//! dispatch, so no locking is needed. The MULTI queue lives here: commands
//! buffered between MULTI and EXEC, plus the dirty flag that poisons the
//! transaction when a queued command fails validation.

use cinder_protocol::CmdLine;

/// Role flags, one bit each.
const FLAG_SLAVE: u8 = 1 << 0;
const FLAG_MASTER: u8 = 1 << 1;
const FLAG_MULTI: u8 = 1 << 2;

/// State carried by one client connection.
pub struct ClientState {
    /// Connection id, unique per engine.
    pub id: u64,
    /// Peer address, for CLIENT and logs.
    pub remote_addr: String,
    /// Name set via CLIENT SETNAME.
    pub name: String,
    /// Currently selected database.
    pub db_index: usize,
    /// Whether AUTH has succeeded (always true with no requirepass).
    pub authed: bool,
    flags: u8,
    /// Commands queued between MULTI and EXEC.
    pub queued: Vec<CmdLine>,
    /// Set when a queued command failed validation; EXEC refuses.
    pub tx_dirty: bool,
}

impl ClientState {
    /// Fresh state for a newly accepted connection.
    pub fn new(id: u64, remote_addr: String) -> Self {
        Self {
            id,
            remote_addr,
            name: String::new(),
            db_index: 0,
            authed: false,
            flags: 0,
            queued: Vec::new(),
            tx_dirty: false,
        }
    }

    /// Returns `true` while inside MULTI.
    pub fn in_multi(&self) -> bool {
        self.flags & FLAG_MULTI != 0
    }

    /// Enters or leaves MULTI state. Entering clears any stale queue.
    pub fn set_multi(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_MULTI;
            self.queued.clear();
            self.tx_dirty = false;
        } else {
            self.flags &= !FLAG_MULTI;
            self.queued.clear();
            self.tx_dirty = false;
        }
    }

    /// Marks this connection as a replica link.
    pub fn set_slave(&mut self) {
        self.flags |= FLAG_SLAVE;
    }

    /// Marks this connection as a master link.
    pub fn set_master(&mut self) {
        self.flags |= FLAG_MASTER;
    }

    /// Returns `true` if flagged as a replica link.
    pub fn is_slave(&self) -> bool {
        self.flags & FLAG_SLAVE != 0
    }

    /// Returns `true` if flagged as a master link.
    pub fn is_master(&self) -> bool {
        self.flags & FLAG_MASTER != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_state_clears_queue() {
        let mut c = ClientState::new(1, "127.0.0.1:50000".into());
        assert!(!c.in_multi());

        c.set_multi(true);
        c.queued.push(vec![]);
        c.tx_dirty = true;
        assert!(c.in_multi());

        c.set_multi(false);
        assert!(!c.in_multi());
        assert!(c.queued.is_empty());
        assert!(!c.tx_dirty);
    }

    #[test]
    fn role_flags_are_independent() {
        let mut c = ClientState::new(1, "x".into());
        c.set_slave();
        assert!(c.is_slave());
        assert!(!c.is_master());
        c.set_master();
        assert!(c.is_slave() && c.is_master());
    }
}
