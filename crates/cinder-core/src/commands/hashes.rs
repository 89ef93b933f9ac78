//! Hash commands: field → value maps under one key.

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use cinder_protocol::Reply;

use crate::database::Database;
use crate::types::Entity;

use super::{
    aof_line, first_key, format_f64, key_str, parse_f64, parse_i64, Arity, CommandSpec,
    NOT_AN_INTEGER, NOT_A_FLOAT, WRONGTYPE,
};

pub(super) fn register_all(register: &mut impl FnMut(CommandSpec)) {
    let single_write = |args: &[Bytes]| (first_key(args), Vec::new());
    let single_read = |args: &[Bytes]| (Vec::new(), first_key(args));

    register(CommandSpec {
        name: "hset",
        arity: Arity::AtLeast(3),
        handler: hset,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "hmset",
        arity: Arity::AtLeast(3),
        handler: hmset,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "hget",
        arity: Arity::Exact(2),
        handler: hget,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "hmget",
        arity: Arity::AtLeast(2),
        handler: hmget,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "hdel",
        arity: Arity::AtLeast(2),
        handler: hdel,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "hexists",
        arity: Arity::Exact(2),
        handler: hexists,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "hlen",
        arity: Arity::Exact(1),
        handler: hlen,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "hkeys",
        arity: Arity::Exact(1),
        handler: hkeys,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "hvals",
        arity: Arity::Exact(1),
        handler: hvals,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "hgetall",
        arity: Arity::Exact(1),
        handler: hgetall,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "hincrby",
        arity: Arity::Exact(3),
        handler: hincrby,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "hincrbyfloat",
        arity: Arity::Exact(3),
        handler: hincrbyfloat,
        keys: single_write,
        mutating: true,
    });
}

fn hset_common(db: &Arc<Database>, args: &[Bytes], name: &str) -> Result<i64, Reply> {
    if args[1..].len() % 2 != 0 {
        return Err(Reply::arity_error(name));
    }
    let key = key_str(&args[0]);
    let result = db.modify_or_insert(
        &key,
        || Entity::Hash(AHashMap::new()),
        |entity| match entity {
            Entity::Hash(map) => {
                let mut added = 0;
                for pair in args[1..].chunks_exact(2) {
                    if map.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                Ok(added)
            }
            _ => Err(()),
        },
    );
    match result {
        Ok(added) => {
            db.add_aof(aof_line("HSET", args));
            Ok(added)
        }
        Err(()) => Err(Reply::error(WRONGTYPE)),
    }
}

fn hset(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match hset_common(db, args, "hset") {
        Ok(added) => Reply::Int(added),
        Err(reply) => reply,
    }
}

fn hmset(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match hset_common(db, args, "hmset") {
        Ok(_) => Reply::Ok,
        Err(reply) => reply,
    }
}

fn hget(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Hash(map) => Ok(map.get(&args[1]).cloned()),
        _ => Err(()),
    }) {
        Some(Ok(Some(val))) => Reply::Bulk(val),
        Some(Ok(None)) => Reply::NullBulk,
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::NullBulk,
    }
}

fn hmget(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Hash(map) => Ok(args[1..]
            .iter()
            .map(|field| match map.get(field) {
                Some(val) => Reply::Bulk(val.clone()),
                None => Reply::NullBulk,
            })
            .collect::<Vec<_>>()),
        _ => Err(()),
    }) {
        Some(Ok(items)) => Reply::MultiBulk(items),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::MultiBulk(vec![Reply::NullBulk; args.len() - 1]),
    }
}

fn hdel(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let key = key_str(&args[0]);
    let result = db.modify(&key, |entity| match entity {
        Entity::Hash(map) => {
            let removed = args[1..].iter().filter(|f| map.remove(*f).is_some()).count();
            Ok((removed, map.is_empty()))
        }
        _ => Err(()),
    });
    match result {
        Some(Ok((removed, emptied))) => {
            if emptied {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(aof_line("HDEL", args));
            }
            Reply::Int(removed as i64)
        }
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn hexists(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Hash(map) => Ok(map.contains_key(&args[1])),
        _ => Err(()),
    }) {
        Some(Ok(found)) => Reply::Int(i64::from(found)),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn hlen(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Hash(map) => Ok(map.len() as i64),
        _ => Err(()),
    }) {
        Some(Ok(len)) => Reply::Int(len),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn hkeys(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Hash(map) => Ok(map.keys().cloned().collect::<Vec<_>>()),
        _ => Err(()),
    }) {
        Some(Ok(fields)) => Reply::bulk_array(fields),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::EmptyMultiBulk,
    }
}

fn hvals(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Hash(map) => Ok(map.values().cloned().collect::<Vec<_>>()),
        _ => Err(()),
    }) {
        Some(Ok(vals)) => Reply::bulk_array(vals),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::EmptyMultiBulk,
    }
}

fn hgetall(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::Hash(map) => Ok(map
            .iter()
            .flat_map(|(f, v)| [f.clone(), v.clone()])
            .collect::<Vec<_>>()),
        _ => Err(()),
    }) {
        Some(Ok(pairs)) => Reply::bulk_array(pairs),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::EmptyMultiBulk,
    }
}

fn hincrby(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let delta = match parse_i64(&args[2]) {
        Ok(d) => d,
        Err(reply) => return reply,
    };

    enum Outcome {
        Value(i64),
        WrongType,
        NotAnInteger,
        Overflow,
    }

    let key = key_str(&args[0]);
    let outcome = db.modify_or_insert(
        &key,
        || Entity::Hash(AHashMap::new()),
        |entity| match entity {
            Entity::Hash(map) => {
                let current = match map.get(&args[1]) {
                    Some(raw) => match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
                        Some(n) => n,
                        None => return Outcome::NotAnInteger,
                    },
                    None => 0i64,
                };
                match current.checked_add(delta) {
                    Some(next) => {
                        map.insert(args[1].clone(), Bytes::from(next.to_string()));
                        Outcome::Value(next)
                    }
                    None => Outcome::Overflow,
                }
            }
            _ => Outcome::WrongType,
        },
    );

    match outcome {
        Outcome::Value(next) => {
            db.add_aof(vec![
                Bytes::from_static(b"HSET"),
                args[0].clone(),
                args[1].clone(),
                Bytes::from(next.to_string()),
            ]);
            Reply::Int(next)
        }
        Outcome::WrongType => Reply::error(WRONGTYPE),
        Outcome::NotAnInteger => Reply::error(NOT_AN_INTEGER),
        Outcome::Overflow => Reply::error("ERR increment or decrement would overflow"),
    }
}

fn hincrbyfloat(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let delta = match parse_f64(&args[2]) {
        Ok(d) => d,
        Err(reply) => return reply,
    };

    enum Outcome {
        Value(String),
        WrongType,
        NotAFloat,
        NanOrInfinity,
    }

    let key = key_str(&args[0]);
    let outcome = db.modify_or_insert(
        &key,
        || Entity::Hash(AHashMap::new()),
        |entity| match entity {
            Entity::Hash(map) => {
                let current = match map.get(&args[1]) {
                    Some(raw) => {
                        match std::str::from_utf8(raw).ok().and_then(|s| s.parse::<f64>().ok()) {
                            Some(f) => f,
                            None => return Outcome::NotAFloat,
                        }
                    }
                    None => 0.0,
                };
                let next = current + delta;
                if next.is_nan() || next.is_infinite() {
                    return Outcome::NanOrInfinity;
                }
                let formatted = format_f64(next);
                map.insert(args[1].clone(), Bytes::from(formatted.clone()));
                Outcome::Value(formatted)
            }
            _ => Outcome::WrongType,
        },
    );

    match outcome {
        Outcome::Value(formatted) => {
            db.add_aof(vec![
                Bytes::from_static(b"HSET"),
                args[0].clone(),
                args[1].clone(),
                Bytes::from(formatted.clone()),
            ]);
            Reply::Bulk(Bytes::from(formatted))
        }
        Outcome::WrongType => Reply::error(WRONGTYPE),
        Outcome::NotAFloat => Reply::error(NOT_A_FLOAT),
        Outcome::NanOrInfinity => Reply::error("ERR increment would produce NaN or Infinity"),
    }
}
