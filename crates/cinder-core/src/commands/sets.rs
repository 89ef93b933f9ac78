//! Set commands, including the multi-key algebra (SINTER/SUNION/SDIFF).

use std::sync::Arc;

use ahash::AHashSet;
use bytes::Bytes;
use cinder_protocol::Reply;

use crate::database::Database;
use crate::types::Entity;

use super::{aof_line, all_keys, first_key, key_str, Arity, CommandSpec, WRONGTYPE};

pub(super) fn register_all(register: &mut impl FnMut(CommandSpec)) {
    let single_write = |args: &[Bytes]| (first_key(args), Vec::new());
    let single_read = |args: &[Bytes]| (Vec::new(), first_key(args));
    let multi_read = |args: &[Bytes]| (Vec::new(), all_keys(args));

    register(CommandSpec {
        name: "sadd",
        arity: Arity::AtLeast(2),
        handler: sadd,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "srem",
        arity: Arity::AtLeast(2),
        handler: srem,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "sismember",
        arity: Arity::Exact(2),
        handler: sismember,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "smembers",
        arity: Arity::Exact(1),
        handler: smembers,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "scard",
        arity: Arity::Exact(1),
        handler: scard,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "sinter",
        arity: Arity::AtLeast(1),
        handler: sinter,
        keys: multi_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "sunion",
        arity: Arity::AtLeast(1),
        handler: sunion,
        keys: multi_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "sdiff",
        arity: Arity::AtLeast(1),
        handler: sdiff,
        keys: multi_read,
        mutating: false,
    });
}

fn sadd(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let key = key_str(&args[0]);
    let result = db.modify_or_insert(
        &key,
        || Entity::Set(AHashSet::new()),
        |entity| match entity {
            Entity::Set(set) => Ok(args[1..]
                .iter()
                .filter(|m| set.insert((*m).clone()))
                .count()),
            _ => Err(()),
        },
    );
    match result {
        Ok(added) => {
            if added > 0 {
                db.add_aof(aof_line("SADD", args));
            }
            Reply::Int(added as i64)
        }
        Err(()) => Reply::error(WRONGTYPE),
    }
}

fn srem(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let key = key_str(&args[0]);
    let result = db.modify(&key, |entity| match entity {
        Entity::Set(set) => {
            let removed = args[1..].iter().filter(|m| set.remove(*m)).count();
            Ok((removed, set.is_empty()))
        }
        _ => Err(()),
    });
    match result {
        Some(Ok((removed, emptied))) => {
            if emptied {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(aof_line("SREM", args));
            }
            Reply::Int(removed as i64)
        }
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn sismember(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Set(set) => Ok(set.contains(&args[1])),
        _ => Err(()),
    }) {
        Some(Ok(found)) => Reply::Int(i64::from(found)),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn smembers(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match read_set(db, &args[0]) {
        Ok(Some(set)) => Reply::bulk_array(set),
        Ok(None) => Reply::EmptyMultiBulk,
        Err(reply) => reply,
    }
}

fn scard(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Set(set) => Ok(set.len() as i64),
        _ => Err(()),
    }) {
        Some(Ok(len)) => Reply::Int(len),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

/// Clones out a set, distinguishing absent (None) from wrong type (Err).
fn read_set(db: &Arc<Database>, key: &Bytes) -> Result<Option<AHashSet<Bytes>>, Reply> {
    match db.view(&key_str(key), |entity| match entity {
        Entity::Set(set) => Ok(set.clone()),
        _ => Err(()),
    }) {
        Some(Ok(set)) => Ok(Some(set)),
        Some(Err(())) => Err(Reply::error(WRONGTYPE)),
        None => Ok(None),
    }
}

fn sinter(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let mut result: Option<AHashSet<Bytes>> = None;
    for key in args {
        let set = match read_set(db, key) {
            Ok(Some(set)) => set,
            // empty operand makes the whole intersection empty
            Ok(None) => return Reply::EmptyMultiBulk,
            Err(reply) => return reply,
        };
        result = Some(match result {
            None => set,
            Some(acc) => acc.intersection(&set).cloned().collect(),
        });
        if result.as_ref().is_some_and(|s| s.is_empty()) {
            return Reply::EmptyMultiBulk;
        }
    }
    Reply::bulk_array(result.unwrap_or_default())
}

fn sunion(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let mut acc: AHashSet<Bytes> = AHashSet::new();
    for key in args {
        match read_set(db, key) {
            Ok(Some(set)) => acc.extend(set),
            Ok(None) => {}
            Err(reply) => return reply,
        }
    }
    Reply::bulk_array(acc)
}

fn sdiff(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let mut acc = match read_set(db, &args[0]) {
        Ok(Some(set)) => set,
        Ok(None) => return Reply::EmptyMultiBulk,
        Err(reply) => return reply,
    };
    for key in &args[1..] {
        match read_set(db, key) {
            Ok(Some(set)) => {
                acc.retain(|m| !set.contains(m));
                if acc.is_empty() {
                    return Reply::EmptyMultiBulk;
                }
            }
            Ok(None) => {}
            Err(reply) => return reply,
        }
    }
    Reply::bulk_array(acc)
}
