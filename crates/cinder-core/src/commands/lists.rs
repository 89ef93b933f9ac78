//! List commands over the paged quicklist.

use std::sync::Arc;

use bytes::Bytes;
use cinder_protocol::Reply;

use crate::database::Database;
use crate::types::{normalize_range, Entity, QuickList};

use super::{aof_line, first_key, key_str, parse_i64, Arity, CommandSpec, WRONGTYPE};

pub(super) fn register_all(register: &mut impl FnMut(CommandSpec)) {
    let single_write = |args: &[Bytes]| (first_key(args), Vec::new());
    let single_read = |args: &[Bytes]| (Vec::new(), first_key(args));

    register(CommandSpec {
        name: "lpush",
        arity: Arity::AtLeast(2),
        handler: lpush,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "rpush",
        arity: Arity::AtLeast(2),
        handler: rpush,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "lpop",
        arity: Arity::Exact(1),
        handler: lpop,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "rpop",
        arity: Arity::Exact(1),
        handler: rpop,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "llen",
        arity: Arity::Exact(1),
        handler: llen,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "lindex",
        arity: Arity::Exact(2),
        handler: lindex,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "lset",
        arity: Arity::Exact(3),
        handler: lset,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "lrange",
        arity: Arity::Exact(3),
        handler: lrange,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "lrem",
        arity: Arity::Exact(3),
        handler: lrem,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "linsert",
        arity: Arity::Exact(4),
        handler: linsert,
        keys: single_write,
        mutating: true,
    });
}

/// Resolves a possibly negative index against a list of `len` elements.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

fn push(db: &Arc<Database>, args: &[Bytes], front: bool, name: &str) -> Reply {
    let key = key_str(&args[0]);
    let result = db.modify_or_insert(
        &key,
        || Entity::List(QuickList::new()),
        |entity| match entity {
            Entity::List(list) => {
                for val in &args[1..] {
                    if front {
                        list.push_front(val.clone());
                    } else {
                        list.push_back(val.clone());
                    }
                }
                Ok(list.len() as i64)
            }
            _ => Err(()),
        },
    );
    match result {
        Ok(len) => {
            db.add_aof(aof_line(name, args));
            Reply::Int(len)
        }
        Err(()) => Reply::error(WRONGTYPE),
    }
}

fn lpush(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    push(db, args, true, "LPUSH")
}

fn rpush(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    push(db, args, false, "RPUSH")
}

fn pop(db: &Arc<Database>, args: &[Bytes], front: bool, name: &str) -> Reply {
    let key = key_str(&args[0]);
    let result = db.modify(&key, |entity| match entity {
        Entity::List(list) => {
            let val = if front { list.pop_front() } else { list.pop_back() };
            Ok((val, list.is_empty()))
        }
        _ => Err(()),
    });
    match result {
        Some(Ok((Some(val), emptied))) => {
            if emptied {
                db.remove(&key);
            }
            db.add_aof(aof_line(name, args));
            Reply::Bulk(val)
        }
        Some(Ok((None, _))) => Reply::NullBulk,
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::NullBulk,
    }
}

fn lpop(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    pop(db, args, true, "LPOP")
}

fn rpop(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    pop(db, args, false, "RPOP")
}

fn llen(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::List(list) => Ok(list.len() as i64),
        _ => Err(()),
    }) {
        Some(Ok(len)) => Reply::Int(len),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn lindex(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let index = match parse_i64(&args[1]) {
        Ok(i) => i,
        Err(reply) => return reply,
    };
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::List(list) => Ok(resolve_index(index, list.len())
            .and_then(|i| list.get(i).cloned())),
        _ => Err(()),
    }) {
        Some(Ok(Some(val))) => Reply::Bulk(val),
        Some(Ok(None)) => Reply::NullBulk,
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::NullBulk,
    }
}

fn lset(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let index = match parse_i64(&args[1]) {
        Ok(i) => i,
        Err(reply) => return reply,
    };
    let result = db.modify(&key_str(&args[0]), |entity| match entity {
        Entity::List(list) => Ok(match resolve_index(index, list.len()) {
            Some(i) => list.set(i, args[2].clone()),
            None => false,
        }),
        _ => Err(()),
    });
    match result {
        Some(Ok(true)) => {
            db.add_aof(aof_line("LSET", args));
            Reply::Ok
        }
        Some(Ok(false)) => Reply::error("ERR index out of range"),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::error(super::NO_SUCH_KEY),
    }
}

fn lrange(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let (start, stop) = match (parse_i64(&args[1]), parse_i64(&args[2])) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::List(list) => {
            let (lo, hi) = normalize_range(start, stop, list.len());
            Ok(list.range(lo, hi))
        }
        _ => Err(()),
    }) {
        Some(Ok(vals)) => Reply::bulk_array(vals),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::EmptyMultiBulk,
    }
}

fn lrem(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let count = match parse_i64(&args[1]) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let key = key_str(&args[0]);
    let result = db.modify(&key, |entity| match entity {
        Entity::List(list) => {
            let removed = list.remove_matching(&args[2], count);
            Ok((removed, list.is_empty()))
        }
        _ => Err(()),
    });
    match result {
        Some(Ok((removed, emptied))) => {
            if emptied {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(aof_line("LREM", args));
            }
            Reply::Int(removed as i64)
        }
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn linsert(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let before = match key_str(&args[1]).to_ascii_uppercase().as_str() {
        "BEFORE" => true,
        "AFTER" => false,
        _ => return Reply::error(super::SYNTAX_ERROR),
    };
    let result = db.modify(&key_str(&args[0]), |entity| match entity {
        Entity::List(list) => Ok(match list.position(&args[2]) {
            Some(pivot) => {
                let at = if before { pivot } else { pivot + 1 };
                list.insert(at, args[3].clone());
                Some(list.len() as i64)
            }
            None => None,
        }),
        _ => Err(()),
    });
    match result {
        Some(Ok(Some(len))) => {
            db.add_aof(aof_line("LINSERT", args));
            Reply::Int(len)
        }
        Some(Ok(None)) => Reply::Int(-1),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}
