//! String commands.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use cinder_protocol::Reply;

use crate::database::Database;
use crate::time::now_unix_ms;
use crate::types::Entity;

use super::{
    aof_expire_at, aof_line, first_key, key_str, paired_keys, parse_f64, parse_i64, Arity,
    CommandSpec, NOT_AN_INTEGER, NOT_A_FLOAT, SYNTAX_ERROR, WRONGTYPE,
};

pub(super) fn register_all(register: &mut impl FnMut(CommandSpec)) {
    register(CommandSpec {
        name: "get",
        arity: Arity::Exact(1),
        handler: get,
        keys: |args| (Vec::new(), first_key(args)),
        mutating: false,
    });
    register(CommandSpec {
        name: "set",
        arity: Arity::AtLeast(2),
        handler: set,
        keys: |args| (first_key(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "setnx",
        arity: Arity::Exact(2),
        handler: setnx,
        keys: |args| (first_key(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "setex",
        arity: Arity::Exact(3),
        handler: setex,
        keys: |args| (first_key(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "mget",
        arity: Arity::AtLeast(1),
        handler: mget,
        keys: |args| (Vec::new(), super::all_keys(args)),
        mutating: false,
    });
    register(CommandSpec {
        name: "mset",
        arity: Arity::AtLeast(2),
        handler: mset,
        keys: |args| (paired_keys(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "msetnx",
        arity: Arity::AtLeast(2),
        handler: msetnx,
        keys: |args| (paired_keys(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "getset",
        arity: Arity::Exact(2),
        handler: getset,
        keys: |args| (first_key(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "strlen",
        arity: Arity::Exact(1),
        handler: strlen,
        keys: |args| (Vec::new(), first_key(args)),
        mutating: false,
    });
    register(CommandSpec {
        name: "append",
        arity: Arity::Exact(2),
        handler: append,
        keys: |args| (first_key(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "incrbyfloat",
        arity: Arity::Exact(2),
        handler: incrbyfloat,
        keys: |args| (first_key(args), Vec::new()),
        mutating: true,
    });

    for (name, handler) in [
        ("incr", incr as super::Handler),
        ("decr", decr),
        ("incrby", incrby),
        ("decrby", decrby),
    ] {
        register(CommandSpec {
            name,
            arity: if matches!(name, "incr" | "decr") {
                Arity::Exact(1)
            } else {
                Arity::Exact(2)
            },
            handler,
            keys: |args| (first_key(args), Vec::new()),
            mutating: true,
        });
    }
}

fn get(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::String(data) => Ok(data.clone()),
        _ => Err(()),
    }) {
        Some(Ok(data)) => Reply::Bulk(data),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::NullBulk,
    }
}

/// Parsed SET options.
#[derive(Default)]
struct SetOptions {
    /// Absolute deadline from EX/PX.
    deadline_ms: Option<u64>,
    nx: bool,
    xx: bool,
    keep_ttl: bool,
}

fn parse_set_options(args: &[Bytes]) -> Result<SetOptions, Reply> {
    let mut opts = SetOptions::default();
    let mut i = 2;
    while i < args.len() {
        let opt = key_str(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "EX" | "PX" => {
                if opts.deadline_ms.is_some() || opts.keep_ttl {
                    return Err(Reply::error(SYNTAX_ERROR));
                }
                let Some(raw) = args.get(i + 1) else {
                    return Err(Reply::error(SYNTAX_ERROR));
                };
                let n = parse_i64(raw)?;
                if n <= 0 {
                    return Err(Reply::error("ERR invalid expire time in 'set' command"));
                }
                let ms = if opt == "EX" { n.saturating_mul(1000) } else { n };
                opts.deadline_ms = Some(now_unix_ms() + ms as u64);
                i += 2;
            }
            "NX" => {
                if opts.xx {
                    return Err(Reply::error(SYNTAX_ERROR));
                }
                opts.nx = true;
                i += 1;
            }
            "XX" => {
                if opts.nx {
                    return Err(Reply::error(SYNTAX_ERROR));
                }
                opts.xx = true;
                i += 1;
            }
            "KEEPTTL" => {
                if opts.deadline_ms.is_some() {
                    return Err(Reply::error(SYNTAX_ERROR));
                }
                opts.keep_ttl = true;
                i += 1;
            }
            _ => return Err(Reply::error(SYNTAX_ERROR)),
        }
    }
    Ok(opts)
}

fn set(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let opts = match parse_set_options(args) {
        Ok(opts) => opts,
        Err(reply) => return reply,
    };
    let key = key_str(&args[0]);
    let entity = Entity::String(args[1].clone());

    let stored = if opts.nx {
        db.put_if_absent(&key, entity)
    } else if opts.xx {
        db.put_if_exists(&key, entity)
    } else if opts.keep_ttl {
        db.put_keep_ttl(&key, entity);
        true
    } else {
        db.put(&key, entity);
        true
    };

    if !stored {
        return Reply::NullBulk;
    }
    // SET discards any previous deadline unless KEEPTTL was given
    if !opts.keep_ttl {
        db.persist(&key);
    }

    db.add_aof(aof_line("SET", &args[..2]));
    if let Some(deadline) = opts.deadline_ms {
        db.expire_at(&key, deadline);
        aof_expire_at(db, &args[0], deadline);
    }
    Reply::Ok
}

fn setnx(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let stored = db.put_if_absent(&key_str(&args[0]), Entity::String(args[1].clone()));
    if stored {
        db.add_aof(aof_line("SET", args));
    }
    Reply::Int(i64::from(stored))
}

fn setex(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let secs = match parse_i64(&args[1]) {
        Ok(n) if n > 0 => n,
        Ok(_) => return Reply::error("ERR invalid expire time in 'setex' command"),
        Err(reply) => return reply,
    };
    let key = key_str(&args[0]);
    db.put(&key, Entity::String(args[2].clone()));
    let deadline = now_unix_ms() + secs as u64 * 1000;
    db.expire_at(&key, deadline);

    db.add_aof(vec![
        Bytes::from_static(b"SET"),
        args[0].clone(),
        args[2].clone(),
    ]);
    aof_expire_at(db, &args[0], deadline);
    Reply::Ok
}

fn mget(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let items = args
        .iter()
        .map(|arg| {
            match db.view(&key_str(arg), |entity| match entity {
                Entity::String(data) => Some(data.clone()),
                _ => None,
            }) {
                Some(Some(data)) => Reply::Bulk(data),
                // wrong type reads as nil under MGET
                _ => Reply::NullBulk,
            }
        })
        .collect();
    Reply::MultiBulk(items)
}

fn mset(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    if args.len() % 2 != 0 {
        return Reply::arity_error("mset");
    }
    for pair in args.chunks_exact(2) {
        db.put(&key_str(&pair[0]), Entity::String(pair[1].clone()));
    }
    db.add_aof(aof_line("MSET", args));
    Reply::Ok
}

fn msetnx(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    if args.len() % 2 != 0 {
        return Reply::arity_error("msetnx");
    }
    // all-or-nothing: the dispatcher holds write locks on every key, so
    // this check-then-set cannot race
    let any_exists = args
        .chunks_exact(2)
        .any(|pair| db.exists(&key_str(&pair[0])));
    if any_exists {
        return Reply::Int(0);
    }
    for pair in args.chunks_exact(2) {
        db.put(&key_str(&pair[0]), Entity::String(pair[1].clone()));
    }
    db.add_aof(aof_line("MSET", args));
    Reply::Int(1)
}

fn getset(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let key = key_str(&args[0]);
    let old = match db.view(&key, |entity| match entity {
        Entity::String(data) => Ok(data.clone()),
        _ => Err(()),
    }) {
        Some(Ok(data)) => Reply::Bulk(data),
        Some(Err(())) => return Reply::error(WRONGTYPE),
        None => Reply::NullBulk,
    };
    db.put(&key, Entity::String(args[1].clone()));
    db.add_aof(aof_line("SET", args));
    old
}

fn strlen(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::String(data) => Ok(data.len() as i64),
        _ => Err(()),
    }) {
        Some(Ok(len)) => Reply::Int(len),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn append(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let key = key_str(&args[0]);
    let suffix = &args[1];
    let result = db.modify_or_insert(
        &key,
        || Entity::String(Bytes::new()),
        |entity| match entity {
            Entity::String(data) => {
                let mut buf = BytesMut::with_capacity(data.len() + suffix.len());
                buf.extend_from_slice(data);
                buf.extend_from_slice(suffix);
                *data = buf.freeze();
                Ok(data.len() as i64)
            }
            _ => Err(()),
        },
    );
    match result {
        Ok(len) => {
            db.add_aof(aof_line("APPEND", args));
            Reply::Int(len)
        }
        Err(()) => Reply::error(WRONGTYPE),
    }
}

enum IncrOutcome {
    Value(i64),
    WrongType,
    NotAnInteger,
    Overflow,
}

/// Shared INCR/DECR/INCRBY/DECRBY core: parse the stored string as i64,
/// apply the checked delta, rewrite in place.
fn incr_common(db: &Arc<Database>, args: &[Bytes], delta: i64) -> Reply {
    let key = key_str(&args[0]);
    let outcome = db.modify_or_insert(
        &key,
        || Entity::String(Bytes::from_static(b"0")),
        |entity| match entity {
            Entity::String(data) => {
                let Some(current) = std::str::from_utf8(data)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                else {
                    return IncrOutcome::NotAnInteger;
                };
                match current.checked_add(delta) {
                    Some(next) => {
                        *data = Bytes::from(next.to_string());
                        IncrOutcome::Value(next)
                    }
                    None => IncrOutcome::Overflow,
                }
            }
            _ => IncrOutcome::WrongType,
        },
    );

    match outcome {
        IncrOutcome::Value(next) => {
            db.add_aof(vec![
                Bytes::from_static(b"SET"),
                args[0].clone(),
                Bytes::from(next.to_string()),
            ]);
            Reply::Int(next)
        }
        IncrOutcome::WrongType => Reply::error(WRONGTYPE),
        IncrOutcome::NotAnInteger => Reply::error(NOT_AN_INTEGER),
        IncrOutcome::Overflow => Reply::error("ERR increment or decrement would overflow"),
    }
}

fn incr(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    incr_common(db, args, 1)
}

fn decr(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    incr_common(db, args, -1)
}

fn incrby(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Ok(delta) => incr_common(db, args, delta),
        Err(reply) => reply,
    }
}

fn decrby(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Ok(delta) => match delta.checked_neg() {
            Some(neg) => incr_common(db, args, neg),
            None => Reply::error(NOT_AN_INTEGER),
        },
        Err(reply) => reply,
    }
}

fn incrbyfloat(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let delta = match parse_f64(&args[1]) {
        Ok(d) => d,
        Err(reply) => return reply,
    };
    let key = key_str(&args[0]);

    enum Outcome {
        Value(String),
        WrongType,
        NotAFloat,
        NanOrInfinity,
    }

    let outcome = db.modify_or_insert(
        &key,
        || Entity::String(Bytes::from_static(b"0")),
        |entity| match entity {
            Entity::String(data) => {
                let Some(current) = std::str::from_utf8(data)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                else {
                    return Outcome::NotAFloat;
                };
                let next = current + delta;
                if next.is_nan() || next.is_infinite() {
                    return Outcome::NanOrInfinity;
                }
                let formatted = super::format_f64(next);
                *data = Bytes::from(formatted.clone());
                Outcome::Value(formatted)
            }
            _ => Outcome::WrongType,
        },
    );

    match outcome {
        Outcome::Value(formatted) => {
            db.add_aof(vec![
                Bytes::from_static(b"SET"),
                args[0].clone(),
                Bytes::from(formatted.clone()),
            ]);
            Reply::Bulk(Bytes::from(formatted))
        }
        Outcome::WrongType => Reply::error(WRONGTYPE),
        Outcome::NotAFloat => Reply::error(NOT_A_FLOAT),
        Outcome::NanOrInfinity => Reply::error("ERR increment would produce NaN or Infinity"),
    }
}
