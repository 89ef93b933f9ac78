//! MULTI/EXEC/DISCARD: the queued-transaction path.
//!
//! Between MULTI and EXEC commands are validated (name and arity only) and
//! buffered on the connection. EXEC takes the union of every queued
//! command's declared keys, locks it in global order, snapshots the write
//! keys, and runs the queue. Any command that replies an error stops
//! execution, restores the snapshots, and EXEC reports EXECABORT, a
//! best-effort rollback over the keys this node owns.

use cinder_protocol::{CmdLine, Reply};

use crate::client::ClientState;
use crate::engine::Engine;
use crate::types::Entity;

const EXECABORT: &str = "EXECABORT Transaction discarded because of previous errors.";

/// MULTI: enter queueing mode.
pub(crate) fn start_multi(client: &mut ClientState) -> Reply {
    if client.in_multi() {
        return Reply::error("ERR MULTI calls can not be nested");
    }
    client.set_multi(true);
    Reply::Ok
}

/// DISCARD: drop the queue and leave queueing mode.
pub(crate) fn discard(client: &mut ClientState) -> Reply {
    if !client.in_multi() {
        return Reply::error("ERR DISCARD without MULTI");
    }
    client.set_multi(false);
    Reply::Ok
}

/// Queue one command. Validation failures still enqueue but poison the
/// transaction, so EXEC will refuse it.
pub(crate) fn enqueue(engine: &Engine, client: &mut ClientState, argv: &CmdLine) -> Reply {
    let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();

    // connection- and server-level commands have no place in a queued
    // transaction; SELECT in particular would make the queued key sets
    // meaningless
    if matches!(
        name.as_str(),
        "select" | "auth" | "ping" | "info" | "client" | "bgrewriteaof"
    ) {
        client.tx_dirty = true;
        return Reply::error(format!(
            "ERR {} is not allowed in transactions",
            name.to_ascii_uppercase()
        ));
    }

    match engine.registry().validate(&name, &argv[1..]) {
        Ok(_) => {
            client.queued.push(argv.clone());
            Reply::Queued
        }
        Err(reply) => {
            client.queued.push(argv.clone());
            client.tx_dirty = true;
            reply
        }
    }
}

/// EXEC: run the queue atomically against the client's database.
pub(crate) fn exec(engine: &Engine, client: &mut ClientState) -> Reply {
    if !client.in_multi() {
        return Reply::error("ERR EXEC without MULTI");
    }
    let queued = std::mem::take(&mut client.queued);
    let dirty = client.tx_dirty;
    client.set_multi(false);

    if dirty {
        return Reply::error(EXECABORT);
    }
    if queued.is_empty() {
        return Reply::EmptyMultiBulk;
    }

    let db = engine.db(client.db_index);

    // union of declared keys across the queue, locked in global order
    let mut write_keys: Vec<String> = Vec::new();
    let mut read_keys: Vec<String> = Vec::new();
    let mut parsed: Vec<(String, CmdLine)> = Vec::with_capacity(queued.len());
    for argv in queued {
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();
        if let Some(spec) = engine.registry().get(&name) {
            let (w, r) = (spec.keys)(&argv[1..]);
            write_keys.extend(w);
            read_keys.extend(r);
        }
        parsed.push((name, argv));
    }
    write_keys.sort();
    write_keys.dedup();
    read_keys.sort();
    read_keys.dedup();

    let guard = db.locks.lock(&write_keys, &read_keys);

    // pre-image of every write key, for rollback
    let snapshots: Vec<(String, Option<(Entity, Option<u64>)>)> = write_keys
        .iter()
        .map(|key| {
            let snap = db.get(key).map(|entity| (entity, db.deadline_ms(key)));
            (key.clone(), snap)
        })
        .collect();

    let mut replies = Vec::with_capacity(parsed.len());
    let mut failed = false;
    for (name, argv) in &parsed {
        let reply = engine.registry().dispatch_unlocked(&db, name, &argv[1..]);
        if reply.is_error() {
            failed = true;
            break;
        }
        replies.push(reply);
    }

    if failed {
        for (key, snap) in snapshots {
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
        drop(guard);
        return Reply::error(EXECABORT);
    }

    drop(guard);
    Reply::MultiBulk(replies)
}
