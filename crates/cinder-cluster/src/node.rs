//! The cluster node: request router and TCC coordinator.
//!
//! Wraps a single-node engine. Each request is routed by key ownership:
//! local execution when this node owns every key's slot, verbatim
//! forwarding through the peer pool otherwise. Slots in migration get the
//! import-on-read / forward-on-write treatment. Multi-key commands whose
//! keys span owners run a try-confirm-cancel round with this node as
//! coordinator; participants stage undo snapshots keyed by a snowflake
//! transaction id.
//!
//! Cluster mode serves database 0 only; SELECT is refused.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use cinder_core::engine::{Engine, EngineConfig, EngineError};
use cinder_core::types::Entity;
use cinder_core::{ClientState, KeyEvents};
use cinder_protocol::{CmdLine, Reply};
use tracing::{debug, warn};

use crate::dump::{dump_reply, load_dump};
use crate::error::ClusterError;
use crate::pool::PeerPool;
use crate::slots::{key_slot, SlotState, SlotTable, SLOT_COUNT};
use crate::topology::Topology;

const CROSSSLOT: &str = "CROSSSLOT Keys in request don't hash to the same node";

/// Cluster-layer settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's announce address (also its id in the topology).
    pub self_addr: String,
    /// Dial/read timeout for peer round trips.
    pub peer_timeout: Duration,
    /// Single-owner multi-key commands skip TCC and run as one call.
    pub allow_fast_transaction: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_addr: "127.0.0.1:6399".into(),
            peer_timeout: Duration::from_millis(2000),
            allow_fast_transaction: true,
        }
    }
}

/// Undo state a participant holds between prepare and commit/cancel.
struct PeerTx {
    cmdline: CmdLine,
    snapshots: Vec<(String, Option<(Entity, Option<u64>)>)>,
}

/// One node of the cluster.
pub struct ClusterNode {
    engine: Arc<Engine>,
    topology: Arc<dyn Topology>,
    slots: Arc<SlotTable>,
    pool: PeerPool,
    transactions: RwLock<AHashMap<u64, PeerTx>>,
    config: ClusterConfig,
}

impl ClusterNode {
    /// Builds the node: slot table first (it is the engine's key-event
    /// bundle), then the engine, then hosts every slot the topology says
    /// is ours.
    pub fn new(
        engine_config: EngineConfig,
        config: ClusterConfig,
        topology: Arc<dyn Topology>,
    ) -> Result<Arc<Self>, EngineError> {
        let slots = Arc::new(SlotTable::new());
        let engine = Engine::new(
            engine_config,
            Some(Arc::clone(&slots) as Arc<dyn KeyEvents>),
        )?;
        let pool = PeerPool::new(
            engine.requirepass().map(str::to_owned),
            config.peer_timeout,
        );

        let node = Arc::new(Self {
            engine,
            topology,
            slots,
            pool,
            transactions: RwLock::new(AHashMap::new()),
            config,
        });
        node.sync_hosted_slots();
        Ok(node)
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The slot table (topology-change handlers drive its transitions).
    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    fn self_id(&self) -> String {
        self.topology.self_id()
    }

    /// Registers every slot the topology assigns to this node.
    fn sync_hosted_slots(&self) {
        let me = self.self_id();
        let mut hosted = 0;
        for slot in 0..SLOT_COUNT {
            if self.topology.slot_owner(slot) == me {
                self.slots.host(slot);
                hosted += 1;
            }
        }
        debug!(hosted, "hosted slots synced from topology");
    }

    /// Topology-change notification: adjusts the local slot state machine.
    pub fn on_slot_owner_changed(&self, slot: u32, new_owner: &str) {
        let me = self.self_id();
        if new_owner == me {
            if !self.slots.hosts(slot) {
                let old_owner = self.topology.slot_owner(slot);
                self.slots.start_import(slot, &old_owner);
            }
        } else if self.slots.hosts(slot) {
            self.slots.start_export(slot, new_owner);
        }
    }

    /// Executes one client command with cluster routing.
    pub async fn exec(&self, client: &mut ClientState, argv: &CmdLine) -> Reply {
        if argv.is_empty() {
            return Reply::error("ERR empty command");
        }
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();

        // auth is always local
        if name == "auth" {
            return self.engine.exec(client, argv);
        }
        if !self.engine.auth_ok(client) {
            return Reply::error("NOAUTH Authentication required");
        }

        match name.as_str() {
            // peer-internal commands
            "tcc_prepare" => return self.handle_prepare(&argv[1..]),
            "tcc_commit" => return self.handle_commit(&argv[1..]),
            "tcc_cancel" => return self.handle_cancel(&argv[1..]),
            "dumpkey" => return self.handle_dumpkey(&argv[1..]),

            "select" => return Reply::error("ERR SELECT is not supported in cluster mode"),
            "exec" => return self.exec_multi(client),

            // local-only commands (no keys, or explicitly node-local)
            "ping" | "info" | "client" | "bgrewriteaof" | "dbsize" | "flushdb" | "keys"
            | "multi" | "discard" => return self.engine.exec(client, argv),
            _ => {}
        }

        if client.in_multi() {
            return self.engine.exec(client, argv);
        }

        let spec = match self.engine.registry().validate(&name, &argv[1..]) {
            Ok(spec) => spec,
            Err(reply) => return reply,
        };
        let (write_keys, read_keys) = (spec.keys)(&argv[1..]);
        let mutating = spec.mutating;
        let mut keys = write_keys;
        keys.extend(read_keys);
        keys.sort();
        keys.dedup();

        if keys.is_empty() {
            return self.engine.exec(client, argv);
        }

        // group keys by owning node
        let me = self.self_id();
        let mut owners: AHashMap<String, Vec<String>> = AHashMap::new();
        for key in &keys {
            let owner = self.topology.slot_owner(key_slot(key));
            owners.entry(owner).or_default().push(key.clone());
        }

        if owners.len() == 1 {
            let owner = owners.keys().next().expect("one owner").clone();
            // an importing slot takes traffic locally even though the
            // topology still names the old owner; forwarding back would
            // bounce between the two migration endpoints
            if owner == me || self.all_slots_importing(&keys) {
                return self.exec_local(client, argv, &keys, mutating).await;
            }
            if keys.len() == 1 || self.config.allow_fast_transaction {
                return self.forward(&owner, argv).await;
            }
        }

        match name.as_str() {
            "del" | "mset" | "msetnx" => self.tcc_coordinate(&name, argv, owners).await,
            "mget" => self.fanout_mget(&argv[1..], &me).await,
            "exists" => self.fanout_exists(owners, &me).await,
            _ => Reply::error(CROSSSLOT),
        }
    }

    /// Per-connection cleanup, delegated to the engine.
    pub fn after_client_close(&self, client: &mut ClientState) {
        self.engine.after_client_close(client);
    }

    /// Shuts the wrapped engine down.
    pub fn close(&self) {
        self.engine.close();
    }

    /// `true` when every key's slot is locally hosted in `Importing`
    /// state.
    fn all_slots_importing(&self, keys: &[String]) -> bool {
        !keys.is_empty()
            && keys.iter().all(|key| {
                self.slots
                    .slot(key_slot(key))
                    .map(|entry| {
                        entry.read().expect("slot lock poisoned").state == SlotState::Importing
                    })
                    .unwrap_or(false)
            })
    }

    // -----------------------------------------------------------------
    // local execution with slot-migration handling
    // -----------------------------------------------------------------

    async fn exec_local(
        &self,
        client: &mut ClientState,
        argv: &CmdLine,
        keys: &[String],
        mutating: bool,
    ) -> Reply {
        for key in keys {
            let slot_id = key_slot(key);
            let Some(entry) = self.slots.slot(slot_id) else {
                continue;
            };
            let (state, old_node, new_node, imported) = {
                let host = entry.read().expect("slot lock poisoned");
                (
                    host.state,
                    host.old_node.clone(),
                    host.new_node.clone(),
                    host.imported_keys.contains(key),
                )
            };
            match state {
                SlotState::Hosted => {}
                SlotState::Importing if !imported => {
                    if let Err(e) = self.import_key(&entry, &old_node, key).await {
                        warn!(key, "key import failed: {e}");
                        return Reply::error(format!("ERR cluster import failed: {e}"));
                    }
                }
                SlotState::Importing => {}
                SlotState::MovingOut => {
                    // the slot is immutable here; the new owner takes writes
                    if mutating {
                        return self.forward(&new_node, argv).await;
                    }
                }
            }
        }
        self.engine.exec(client, argv)
    }

    /// Pulls one key from the slot's old owner and marks it imported.
    /// A key absent on the old node is marked too, so deletes stay
    /// distinguishable from not-yet-migrated keys.
    async fn import_key(
        &self,
        entry: &Arc<RwLock<crate::slots::HostSlot>>,
        old_node: &str,
        key: &str,
    ) -> Result<(), ClusterError> {
        let addr = self
            .topology
            .node_addr(old_node)
            .ok_or_else(|| ClusterError::UnknownNode(old_node.to_owned()))?;
        let dump_cmd = vec![
            Bytes::from_static(b"dumpkey"),
            Bytes::copy_from_slice(key.as_bytes()),
        ];
        let reply = self.pool.round_trip(&addr, &dump_cmd).await?;

        match reply {
            Reply::NullBulk => {}
            dump => {
                let (entity, deadline) = load_dump(dump)?;
                let db = self.engine.db(0);
                db.put(key, entity);
                if let Some(deadline) = deadline {
                    db.expire_at(key, deadline);
                }
            }
        }

        let mut host = entry.write().expect("slot lock poisoned");
        host.imported_keys.insert(key.to_owned());
        Ok(())
    }

    async fn forward(&self, node: &str, argv: &CmdLine) -> Reply {
        let Some(addr) = self.topology.node_addr(node) else {
            return Reply::error(format!("ERR unknown cluster node '{node}'"));
        };
        match self.pool.round_trip(&addr, argv).await {
            Ok(reply) => reply,
            Err(ClusterError::PeerTimeout) => Reply::error("ERR cluster peer timeout"),
            Err(e) => Reply::error(format!("ERR cluster peer failure: {e}")),
        }
    }

    // -----------------------------------------------------------------
    // MULTI/EXEC: local transactions only
    // -----------------------------------------------------------------

    /// EXEC with a locality check: every queued key must be owned (and not
    /// moving out) here, because the queue executes as one local
    /// transaction.
    fn exec_multi(&self, client: &mut ClientState) -> Reply {
        let me = self.self_id();
        for argv in &client.queued {
            let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();
            let Ok(spec) = self.engine.registry().validate(&name, &argv[1..]) else {
                continue; // dirty transactions abort inside the engine
            };
            let (write_keys, read_keys) = (spec.keys)(&argv[1..]);
            for key in write_keys.iter().chain(read_keys.iter()) {
                if self.topology.slot_owner(key_slot(key)) != me {
                    client.set_multi(false);
                    return Reply::error(
                        "ERR transaction keys must all be served by this node",
                    );
                }
            }
        }
        let exec_line = vec![Bytes::from_static(b"EXEC")];
        self.engine.exec(client, &exec_line)
    }

    // -----------------------------------------------------------------
    // TCC: try-confirm-cancel across owners
    // -----------------------------------------------------------------

    /// Builds the per-owner slice of `name` covering `keys`.
    fn sub_command(&self, name: &str, argv: &CmdLine, keys: &[String]) -> CmdLine {
        match name {
            "del" => {
                let mut line = vec![Bytes::from_static(b"DEL")];
                line.extend(keys.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())));
                line
            }
            // mset/msetnx: pick the key-value pairs whose key this owner has
            _ => {
                let upper = if name == "mset" { "MSET" } else { "MSETNX" };
                let mut line = vec![Bytes::from_static(upper.as_bytes())];
                for pair in argv[1..].chunks_exact(2) {
                    let key = String::from_utf8_lossy(&pair[0]);
                    if keys.iter().any(|k| k == key.as_ref()) {
                        line.push(pair[0].clone());
                        line.push(pair[1].clone());
                    }
                }
                line
            }
        }
    }

    async fn tcc_coordinate(
        &self,
        name: &str,
        argv: &CmdLine,
        owners: AHashMap<String, Vec<String>>,
    ) -> Reply {
        let me = self.self_id();
        let txid = self.engine.id_gen().next_id();
        let txid_arg = Bytes::from(txid.to_string());

        // try: prepare every participant
        let mut prepared: Vec<String> = Vec::new();
        let mut blocked = false;
        for (owner, keys) in &owners {
            let sub = self.sub_command(name, argv, keys);
            let reply = if *owner == me {
                self.local_prepare(txid, sub)
            } else {
                let mut line = vec![Bytes::from_static(b"tcc_prepare"), txid_arg.clone()];
                line.extend(sub);
                self.forward(owner, &line).await
            };
            match reply {
                Reply::Int(0) => {
                    // precondition failed (MSETNX key exists): no undo state
                    // was staged on that participant
                    blocked = true;
                    break;
                }
                reply if reply.is_error() => {
                    self.tcc_cancel_all(&prepared, txid).await;
                    return reply;
                }
                _ => prepared.push(owner.clone()),
            }
        }

        if blocked {
            self.tcc_cancel_all(&prepared, txid).await;
            return Reply::Int(0);
        }

        // confirm: commit everywhere, merging replies
        let mut int_sum = 0i64;
        let mut failed: Option<Reply> = None;
        for owner in &prepared {
            let reply = if *owner == me {
                self.local_commit(txid)
            } else {
                let line = vec![Bytes::from_static(b"tcc_commit"), txid_arg.clone()];
                self.forward(owner, &line).await
            };
            match reply {
                Reply::Int(n) => int_sum += n,
                Reply::Ok => {}
                other if other.is_error() && failed.is_none() => failed = Some(other),
                _ => {}
            }
        }
        if let Some(err) = failed {
            // commit already applied on some peers; best-effort only
            warn!(txid, "tcc commit partially failed");
            return err;
        }

        match name {
            "del" => Reply::Int(int_sum),
            "mset" => Reply::Ok,
            _ => Reply::Int(1),
        }
    }

    /// Cancels every prepared participant after a failed try phase.
    async fn tcc_cancel_all(&self, prepared: &[String], txid: u64) {
        let me = self.self_id();
        for owner in prepared {
            if *owner == me {
                self.local_cancel(txid);
            } else {
                let line = vec![
                    Bytes::from_static(b"tcc_cancel"),
                    Bytes::from(txid.to_string()),
                ];
                let _ = self.forward(owner, &line).await;
            }
        }
    }

    // -----------------------------------------------------------------
    // TCC participant side
    // -----------------------------------------------------------------

    fn parse_txid(arg: Option<&Bytes>) -> Result<u64, Reply> {
        arg.and_then(|a| std::str::from_utf8(a).ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Reply::error("ERR bad transaction id"))
    }

    fn handle_prepare(&self, args: &[Bytes]) -> Reply {
        let txid = match Self::parse_txid(args.first()) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        if args.len() < 2 {
            return Reply::arity_error("tcc_prepare");
        }
        self.local_prepare(txid, args[1..].to_vec())
    }

    fn handle_commit(&self, args: &[Bytes]) -> Reply {
        match Self::parse_txid(args.first()) {
            Ok(txid) => self.local_commit(txid),
            Err(reply) => reply,
        }
    }

    fn handle_cancel(&self, args: &[Bytes]) -> Reply {
        match Self::parse_txid(args.first()) {
            Ok(txid) => self.local_cancel(txid),
            Err(reply) => reply,
        }
    }

    fn handle_dumpkey(&self, args: &[Bytes]) -> Reply {
        let Some(key_raw) = args.first() else {
            return Reply::arity_error("dumpkey");
        };
        let key = String::from_utf8_lossy(key_raw).into_owned();
        let db = self.engine.db(0);
        match db.get(&key) {
            Some(entity) => dump_reply(&entity, db.deadline_ms(&key)),
            None => Reply::NullBulk,
        }
    }

    /// Stage undo snapshots for `cmdline`. MSETNX preconditions are
    /// checked here so a doomed transaction never stages state.
    fn local_prepare(&self, txid: u64, cmdline: CmdLine) -> Reply {
        let name = String::from_utf8_lossy(&cmdline[0]).to_ascii_lowercase();
        let spec = match self.engine.registry().validate(&name, &cmdline[1..]) {
            Ok(spec) => spec,
            Err(reply) => return reply,
        };
        let (write_keys, _) = (spec.keys)(&cmdline[1..]);
        let db = self.engine.db(0);

        if name == "msetnx" && write_keys.iter().any(|k| db.exists(k)) {
            return Reply::Int(0);
        }

        let snapshots = write_keys
            .iter()
            .map(|key| {
                let snap = db.get(key).map(|entity| (entity, db.deadline_ms(key)));
                (key.clone(), snap)
            })
            .collect();

        self.transactions
            .write()
            .expect("tx table lock poisoned")
            .insert(txid, PeerTx { cmdline, snapshots });
        Reply::Ok
    }

    fn local_commit(&self, txid: u64) -> Reply {
        let Some(tx) = self
            .transactions
            .write()
            .expect("tx table lock poisoned")
            .remove(&txid)
        else {
            return Reply::error("ERR unknown transaction");
        };
        self.engine.exec_on_db(0, &tx.cmdline)
    }

    fn local_cancel(&self, txid: u64) -> Reply {
        let Some(tx) = self
            .transactions
            .write()
            .expect("tx table lock poisoned")
            .remove(&txid)
        else {
            return Reply::Ok; // nothing staged, nothing to undo
        };
        let db = self.engine.db(0);
        for (key, snap) in tx.snapshots {
            match snap {
                Some((entity, deadline)) => {
                    db.put(&key, entity);
                    if let Some(deadline) = deadline {
                        db.expire_at(&key, deadline);
                    }
                }
                None => {
                    db.remove(&key);
                }
            }
        }
        Reply::Ok
    }

    // -----------------------------------------------------------------
    // read fan-outs (no TCC needed)
    // -----------------------------------------------------------------

    async fn fanout_mget(&self, key_args: &[Bytes], me: &str) -> Reply {
        let mut results: Vec<Reply> = vec![Reply::NullBulk; key_args.len()];
        for (i, key_raw) in key_args.iter().enumerate() {
            let key = String::from_utf8_lossy(key_raw).into_owned();
            let owner = self.topology.slot_owner(key_slot(&key));
            let line = vec![Bytes::from_static(b"GET"), key_raw.clone()];
            let reply = if owner == me {
                self.engine.exec_on_db(0, &line)
            } else {
                self.forward(&owner, &line).await
            };
            if let Reply::Bulk(data) = reply {
                results[i] = Reply::Bulk(data);
            }
        }
        Reply::MultiBulk(results)
    }

    async fn fanout_exists(&self, owners: AHashMap<String, Vec<String>>, me: &str) -> Reply {
        let mut total = 0i64;
        for (owner, keys) in owners {
            let mut line = vec![Bytes::from_static(b"EXISTS")];
            line.extend(keys.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())));
            let reply = if owner == me {
                self.engine.exec_on_db(0, &line)
            } else {
                self.forward(&owner, &line).await
            };
            if let Reply::Int(n) = reply {
                total += n;
            }
        }
        Reply::Int(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::SeedTopology;

    fn line(parts: &[&str]) -> CmdLine {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    fn single_node() -> (Arc<ClusterNode>, ClientState) {
        let topo = Arc::new(SeedTopology::single("127.0.0.1:7001".into()));
        let node = ClusterNode::new(
            EngineConfig::default(),
            ClusterConfig {
                self_addr: "127.0.0.1:7001".into(),
                ..ClusterConfig::default()
            },
            topo,
        )
        .unwrap();
        let client = node.engine().new_client("test".into());
        (node, client)
    }

    #[tokio::test]
    async fn single_node_serves_everything_locally() {
        let (node, mut client) = single_node();
        assert_eq!(
            node.exec(&mut client, &line(&["SET", "k", "v"])).await,
            Reply::Ok
        );
        assert_eq!(
            node.exec(&mut client, &line(&["GET", "k"])).await,
            Reply::Bulk(Bytes::from_static(b"v"))
        );
        assert_eq!(node.slots().hosted_count(), SLOT_COUNT as usize);
    }

    #[tokio::test]
    async fn slot_key_sets_follow_mutations() {
        let (node, mut client) = single_node();
        node.exec(&mut client, &line(&["SET", "tracked", "1"])).await;
        let slot = key_slot("tracked");
        assert_eq!(node.slots().keys_in_slot(slot), vec!["tracked".to_owned()]);

        node.exec(&mut client, &line(&["DEL", "tracked"])).await;
        assert!(node.slots().keys_in_slot(slot).is_empty());
    }

    #[tokio::test]
    async fn select_is_refused() {
        let (node, mut client) = single_node();
        let reply = node.exec(&mut client, &line(&["SELECT", "1"])).await;
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn dumpkey_round_trips_an_entity() {
        let (node, mut client) = single_node();
        node.exec(&mut client, &line(&["RPUSH", "l", "a", "b"])).await;
        let dump = node.exec(&mut client, &line(&["dumpkey", "l"])).await;
        let (entity, deadline) = load_dump(dump).unwrap();
        assert!(matches!(entity, Entity::List(l) if l.len() == 2));
        assert_eq!(deadline, None);

        let missing = node.exec(&mut client, &line(&["dumpkey", "ghost"])).await;
        assert_eq!(missing, Reply::NullBulk);
    }

    #[tokio::test]
    async fn tcc_prepare_commit_applies_command() {
        let (node, _client) = single_node();
        let reply = node.local_prepare(42, line(&["MSET", "a", "1", "b", "2"]));
        assert_eq!(reply, Reply::Ok);
        let reply = node.local_commit(42);
        assert_eq!(reply, Reply::Ok);

        let db = node.engine().db(0);
        assert!(db.exists("a") && db.exists("b"));
    }

    #[tokio::test]
    async fn tcc_cancel_restores_preimage() {
        let (node, mut client) = single_node();
        node.exec(&mut client, &line(&["SET", "a", "orig"])).await;

        node.local_prepare(7, line(&["DEL", "a", "b"]));
        // simulate the command having run before the cancel arrives
        node.engine().exec_on_db(0, &line(&["DEL", "a"]));
        assert!(!node.engine().db(0).exists("a"));

        node.local_cancel(7);
        let db = node.engine().db(0);
        assert!(db.exists("a"), "snapshot should restore the deleted key");
        assert!(!db.exists("b"), "keys absent at prepare stay absent");
    }

    #[tokio::test]
    async fn tcc_commit_unknown_txid_errors() {
        let (node, _client) = single_node();
        assert!(node.local_commit(999).is_error());
        // cancel of an unknown tx is a no-op, not an error
        assert_eq!(node.local_cancel(999), Reply::Ok);
    }

    #[tokio::test]
    async fn msetnx_prepare_respects_existing_keys() {
        let (node, mut client) = single_node();
        node.exec(&mut client, &line(&["SET", "taken", "x"])).await;
        let reply = node.local_prepare(1, line(&["MSETNX", "taken", "1", "free", "2"]));
        assert_eq!(reply, Reply::Int(0));
        assert!(!node.engine().db(0).exists("free"));
    }

    #[tokio::test]
    async fn moving_out_slot_keeps_serving_reads() {
        let (node, mut client) = single_node();
        node.exec(&mut client, &line(&["SET", "stay", "1"])).await;
        let slot = key_slot("stay");
        node.slots().start_export(slot, "other:1");

        let reply = node.exec(&mut client, &line(&["GET", "stay"])).await;
        assert_eq!(reply, Reply::Bulk(Bytes::from_static(b"1")));
    }
}
