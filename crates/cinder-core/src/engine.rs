//! The command execution engine.
//!
//! One `Engine` owns the logical databases, the command registry, the time
//! wheel, and the AOF handle. Everything mutable is reached through it:
//! there are no globals. Connection drivers call [`Engine::exec`] with the
//! per-client state; the engine routes control commands (AUTH, SELECT,
//! MULTI family, INFO, CLIENT, BGREWRITEAOF) itself and everything else
//! through the registry against the client's selected database.
//!
//! Every dispatch runs inside a panic boundary: a faulting handler is
//! logged and answered with `-ERR unknown`, never allowed to take the
//! server down.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use cinder_persistence::aof::encode_record;
use cinder_persistence::replay::ReplayError;
use cinder_persistence::{AofError, AofHandle, AofReplayer, FsyncPolicy};
use cinder_protocol::{CmdLine, Reply};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{error, info};

use crate::client::ClientState;
use crate::commands::CommandRegistry;
use crate::database::{Database, KeyEvents};
use crate::idgen::IdGenerator;
use crate::timewheel::{TimeWheel, DEFAULT_BUCKETS, DEFAULT_TICK};
use crate::tx;
use crate::types::Entity;

/// AOF settings, when persistence is enabled.
#[derive(Debug, Clone)]
pub struct AofConfig {
    pub path: PathBuf,
    pub fsync: FsyncPolicy,
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of logical databases (SELECT range).
    pub databases: usize,
    /// Password required by AUTH; `None` disables authentication.
    pub requirepass: Option<String>,
    /// This node's announce name, seeds the id generator.
    pub node_name: String,
    /// Listening port, reported by INFO.
    pub tcp_port: u16,
    /// Append-only persistence; `None` disables it.
    pub aof: Option<AofConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            databases: 16,
            requirepass: None,
            node_name: "127.0.0.1:6399".into(),
            tcp_port: 6399,
            aof: None,
        }
    }
}

/// Errors that abort engine startup.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    BadConfig(String),

    #[error(transparent)]
    Aof(#[from] AofError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("aof replay: command failed: {0}")]
    ReplayCommand(String),
}

/// The single-node execution engine.
pub struct Engine {
    config: EngineConfig,
    run_id: String,
    dbs: Vec<Arc<Database>>,
    registry: CommandRegistry,
    aof: Option<Arc<AofHandle>>,
    wheel: TimeWheel,
    id_gen: IdGenerator,
    next_client_id: AtomicU64,
    connected_clients: AtomicUsize,
    /// Self-handle for background tasks (AOF rewrite) that need an owned
    /// reference.
    me: std::sync::Weak<Engine>,
}

impl Engine {
    /// Builds the engine: creates databases, replays the AOF if one exists,
    /// then arms the AOF sinks. Must run inside a tokio runtime (the time
    /// wheel spawns its task here).
    pub fn new(
        config: EngineConfig,
        events: Option<Arc<dyn KeyEvents>>,
    ) -> Result<Arc<Self>, EngineError> {
        if config.databases == 0 {
            return Err(EngineError::BadConfig("databases must be >= 1".into()));
        }

        let wheel = TimeWheel::start(DEFAULT_TICK, DEFAULT_BUCKETS);
        let dbs: Vec<Arc<Database>> = (0..config.databases)
            .map(|i| Database::new(i, wheel.clone(), events.clone()))
            .collect();
        let registry = CommandRegistry::new();

        // replay before the sinks are armed, so recovered commands don't
        // re-append themselves
        let mut aof = None;
        if let Some(aof_cfg) = &config.aof {
            if aof_cfg.path.exists() {
                replay_aof(&registry, &dbs, &aof_cfg.path)?;
            }
            let handle = Arc::new(AofHandle::open(&aof_cfg.path, aof_cfg.fsync)?);
            for db in &dbs {
                let h = Arc::clone(&handle);
                db.set_aof_sink(Some(Arc::new(move |db_index, line: &CmdLine| {
                    h.append(db_index, line.clone());
                })));
            }
            aof = Some(handle);
        }

        let run_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        let id_gen = IdGenerator::new(&config.node_name);

        let engine = Arc::new_cyclic(|me| Self {
            run_id,
            dbs,
            registry,
            aof,
            wheel,
            id_gen,
            next_client_id: AtomicU64::new(1),
            connected_clients: AtomicUsize::new(0),
            me: me.clone(),
            config,
        });

        info!(
            databases = engine.config.databases,
            aof = engine.aof.is_some(),
            "engine ready"
        );
        Ok(engine)
    }

    /// The command registry.
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Whether `client` has satisfied the auth requirement.
    pub fn auth_ok(&self, client: &ClientState) -> bool {
        self.config.requirepass.is_none() || client.authed
    }

    /// The configured password, for peer connections in cluster mode.
    pub fn requirepass(&self) -> Option<&str> {
        self.config.requirepass.as_deref()
    }

    /// Database by index. Panics on out-of-range (callers validate).
    pub fn db(&self, index: usize) -> Arc<Database> {
        Arc::clone(&self.dbs[index])
    }

    /// Number of configured databases.
    pub fn database_count(&self) -> usize {
        self.dbs.len()
    }

    /// The node-scoped snowflake generator (shared with the cluster layer).
    pub fn id_gen(&self) -> &IdGenerator {
        &self.id_gen
    }

    /// Allocates state for a freshly accepted connection.
    pub fn new_client(&self, remote_addr: String) -> ClientState {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut client = ClientState::new(id, remote_addr);
        client.authed = self.config.requirepass.is_none();
        client
    }

    /// Per-connection cleanup: discard MULTI state, drop the client count.
    pub fn after_client_close(&self, client: &mut ClientState) {
        client.set_multi(false);
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
    }

    /// Executes one command for `client`, never panicking outward.
    pub fn exec(&self, client: &mut ClientState, argv: &CmdLine) -> Reply {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.exec_inner(client, argv))) {
            Ok(reply) => reply,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(command = ?argv.first(), "command handler panicked: {msg}");
                Reply::Unknown
            }
        }
    }

    fn exec_inner(&self, client: &mut ClientState, argv: &CmdLine) -> Reply {
        if argv.is_empty() {
            return Reply::error("ERR empty command");
        }
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();
        let args = &argv[1..];

        if name == "auth" {
            return self.auth(client, args);
        }
        if self.config.requirepass.is_some() && !client.authed {
            return Reply::error("NOAUTH Authentication required");
        }

        match name.as_str() {
            "multi" => {
                if !args.is_empty() {
                    return Reply::arity_error("multi");
                }
                tx::start_multi(client)
            }
            "discard" => {
                if !args.is_empty() {
                    return Reply::arity_error("discard");
                }
                tx::discard(client)
            }
            "exec" => {
                if !args.is_empty() {
                    return Reply::arity_error("exec");
                }
                tx::exec(self, client)
            }
            _ if client.in_multi() => tx::enqueue(self, client, argv),
            "ping" => match args.len() {
                0 => Reply::Pong,
                1 => Reply::Bulk(args[0].clone()),
                _ => Reply::arity_error("ping"),
            },
            "select" => self.select(client, args),
            "info" => self.info(args),
            "client" => Self::client_cmd(client, args),
            "bgrewriteaof" => self.bgrewriteaof(),
            _ => {
                let db = self.db(client.db_index);
                let reply = self.registry.dispatch(&db, &name, args);
                self.check_aof_health(reply)
            }
        }
    }

    /// Dispatch used by AOF replay and the cluster layer: no auth, no
    /// MULTI, straight to the registry.
    pub fn exec_on_db(&self, db_index: usize, argv: &CmdLine) -> Reply {
        if argv.is_empty() {
            return Reply::error("ERR empty command");
        }
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();
        let db = self.db(db_index);
        self.registry.dispatch(&db, &name, &argv[1..])
    }

    /// Under `always`, a failed append surfaces as MISCONF instead of the
    /// success reply.
    fn check_aof_health(&self, reply: Reply) -> Reply {
        if let Some(aof) = &self.aof {
            if aof.policy() == FsyncPolicy::Always {
                if let Some(err) = aof.take_error() {
                    return Reply::error(format!(
                        "MISCONF Errors writing to the append-only file: {err}"
                    ));
                }
            }
        }
        reply
    }

    fn auth(&self, client: &mut ClientState, args: &[Bytes]) -> Reply {
        let Some(expected) = &self.config.requirepass else {
            return Reply::error("ERR Client sent AUTH, but no password is set");
        };
        if args.len() != 1 {
            return Reply::arity_error("auth");
        }
        if expected.as_bytes() == &args[0][..] {
            client.authed = true;
            Reply::Ok
        } else {
            client.authed = false;
            Reply::error("ERR invalid password")
        }
    }

    fn select(&self, client: &mut ClientState, args: &[Bytes]) -> Reply {
        if args.len() != 1 {
            return Reply::arity_error("select");
        }
        let index = match std::str::from_utf8(&args[0])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            Some(i) => i,
            None => return Reply::error("ERR invalid DB index"),
        };
        if index >= self.dbs.len() {
            return Reply::error("ERR DB index is out of range");
        }
        client.db_index = index;
        Reply::Ok
    }

    fn info(&self, args: &[Bytes]) -> Reply {
        let section = args
            .first()
            .map(|s| String::from_utf8_lossy(s).to_ascii_lowercase());
        let mut out = String::new();

        let want = |name: &str| section.as_deref().map(|s| s == name).unwrap_or(true);

        if want("server") {
            out.push_str("# Server\r\n");
            out.push_str("cinder_version:0.1.0\r\n");
            out.push_str(&format!("run_id:{}\r\n", self.run_id));
            out.push_str(&format!("tcp_port:{}\r\n", self.config.tcp_port));
            out.push_str("\r\n");
        }
        if want("clients") {
            out.push_str("# Clients\r\n");
            out.push_str(&format!(
                "connected_clients:{}\r\n",
                self.connected_clients.load(Ordering::Relaxed)
            ));
            out.push_str("\r\n");
        }
        if want("keyspace") {
            out.push_str("# Keyspace\r\n");
            for db in &self.dbs {
                let keys = db.key_count();
                if keys > 0 {
                    let expires = db
                        .keys()
                        .iter()
                        .filter(|k| db.deadline_ms(k).is_some())
                        .count();
                    out.push_str(&format!(
                        "db{}:keys={},expires={}\r\n",
                        db.index(),
                        keys,
                        expires
                    ));
                }
            }
            out.push_str("\r\n");
        }

        if out.is_empty() {
            return Reply::error(format!(
                "ERR unsupported INFO section '{}'",
                section.unwrap_or_default()
            ));
        }
        Reply::Bulk(Bytes::from(out))
    }

    fn client_cmd(client: &mut ClientState, args: &[Bytes]) -> Reply {
        let Some(sub) = args.first() else {
            return Reply::arity_error("client");
        };
        match String::from_utf8_lossy(sub).to_ascii_uppercase().as_str() {
            "ID" => Reply::Int(client.id as i64),
            "GETNAME" => Reply::Bulk(Bytes::from(client.name.clone())),
            "SETNAME" => match args.get(1) {
                Some(name) => {
                    client.name = String::from_utf8_lossy(name).into_owned();
                    Reply::Ok
                }
                None => Reply::arity_error("client"),
            },
            other => Reply::error(format!("ERR unknown CLIENT subcommand '{other}'")),
        }
    }

    /// BGREWRITEAOF: snapshot every database into a minimal log and swap
    /// it in atomically. Runs on a blocking task; the reply returns
    /// immediately.
    fn bgrewriteaof(&self) -> Reply {
        let Some(aof) = self.aof.clone() else {
            return Reply::error("ERR AOF is not enabled on this server");
        };
        let engine = self.me.upgrade().expect("engine alive while in use");
        tokio::task::spawn_blocking(move || {
            let payload = engine.build_rewrite_payload();
            if let Err(e) = aof.rewrite(payload) {
                error!("background aof rewrite failed: {e}");
            }
        });
        Reply::Status("Background append only file rewriting started".into())
    }

    /// One canonical write command per key, plus PEXPIREAT for keys with a
    /// deadline, serialized with interleaved SELECT frames.
    pub fn build_rewrite_payload(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        let mut last_db = None;
        for db in &self.dbs {
            db.for_each_entity(|key, entity| {
                let key_bytes = Bytes::copy_from_slice(key.as_bytes());
                let line = rewrite_line(&key_bytes, entity);
                encode_record(db.index(), &line, &mut last_db, &mut out);
                if let Some(deadline) = db.deadline_ms(key) {
                    let expire = vec![
                        Bytes::from_static(b"PEXPIREAT"),
                        key_bytes,
                        Bytes::from(deadline.to_string()),
                    ];
                    encode_record(db.index(), &expire, &mut last_db, &mut out);
                }
            });
        }
        out.to_vec()
    }

    /// Orderly shutdown: stop timers, flush and close the log.
    pub fn close(&self) {
        self.wheel.stop();
        if let Some(aof) = &self.aof {
            if let Err(e) = aof.flush_sync() {
                error!("final aof flush failed: {e}");
            }
            aof.shutdown();
        }
        info!("engine closed");
    }
}

fn replay_aof(
    registry: &CommandRegistry,
    dbs: &[Arc<Database>],
    path: &std::path::Path,
) -> Result<(), EngineError> {
    let mut replayer = AofReplayer::open(path)?;
    let mut applied = 0u64;
    while let Some((db_index, line)) = replayer.next_record()? {
        let Some(db) = dbs.get(db_index) else {
            return Err(EngineError::ReplayCommand(format!(
                "db index {db_index} out of range"
            )));
        };
        let name = String::from_utf8_lossy(&line[0]).to_ascii_lowercase();
        let reply = registry.dispatch(db, &name, &line[1..]);
        if reply.is_error() {
            let msg = match reply {
                Reply::Err(msg) => msg,
                _ => "unknown".into(),
            };
            return Err(EngineError::ReplayCommand(msg));
        }
        applied += 1;
    }
    info!(records = applied, "aof replay complete");
    Ok(())
}

/// The canonical write command that reconstructs one entity.
fn rewrite_line(key: &Bytes, entity: &Entity) -> CmdLine {
    match entity {
        Entity::String(data) => vec![Bytes::from_static(b"SET"), key.clone(), data.clone()],
        Entity::List(list) => {
            let mut line = Vec::with_capacity(list.len() + 2);
            line.push(Bytes::from_static(b"RPUSH"));
            line.push(key.clone());
            line.extend(list.iter().cloned());
            line
        }
        Entity::Hash(map) => {
            let mut line = Vec::with_capacity(map.len() * 2 + 2);
            line.push(Bytes::from_static(b"HSET"));
            line.push(key.clone());
            for (field, value) in map {
                line.push(field.clone());
                line.push(value.clone());
            }
            line
        }
        Entity::Set(set) => {
            let mut line = Vec::with_capacity(set.len() + 2);
            line.push(Bytes::from_static(b"SADD"));
            line.push(key.clone());
            line.extend(set.iter().cloned());
            line
        }
        Entity::ZSet(zset) => {
            let mut line = Vec::with_capacity(zset.len() * 2 + 2);
            line.push(Bytes::from_static(b"ZADD"));
            line.push(key.clone());
            for (member, score) in zset.iter() {
                line.push(Bytes::from(crate::commands::format_f64(score)));
                line.push(Bytes::copy_from_slice(member.as_bytes()));
            }
            line
        }
    }
}
