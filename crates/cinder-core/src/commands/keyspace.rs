//! Generic key commands: existence, deletion, renaming, expiry, KEYS.

use std::sync::Arc;

use bytes::Bytes;
use cinder_protocol::Reply;

use crate::database::{Database, TtlState};
use crate::time::now_unix_ms;

use super::{
    aof_expire_at, aof_line, all_keys, first_key, glob_match, key_str, no_keys, parse_i64,
    Arity, CommandSpec, NO_SUCH_KEY,
};

pub(super) fn register_all(register: &mut impl FnMut(CommandSpec)) {
    register(CommandSpec {
        name: "exists",
        arity: Arity::AtLeast(1),
        handler: exists,
        keys: |args| (Vec::new(), all_keys(args)),
        mutating: false,
    });
    register(CommandSpec {
        name: "del",
        arity: Arity::AtLeast(1),
        handler: del,
        keys: |args| (all_keys(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "type",
        arity: Arity::Exact(1),
        handler: type_cmd,
        keys: |args| (Vec::new(), first_key(args)),
        mutating: false,
    });
    register(CommandSpec {
        name: "rename",
        arity: Arity::Exact(2),
        handler: rename,
        keys: |args| (all_keys(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "renamenx",
        arity: Arity::Exact(2),
        handler: renamenx,
        keys: |args| (all_keys(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "keys",
        arity: Arity::Exact(1),
        handler: keys_cmd,
        keys: no_keys,
        mutating: false,
    });
    register(CommandSpec {
        name: "dbsize",
        arity: Arity::Exact(0),
        handler: dbsize,
        keys: no_keys,
        mutating: false,
    });
    register(CommandSpec {
        name: "flushdb",
        arity: Arity::Exact(0),
        handler: flushdb,
        keys: no_keys,
        mutating: true,
    });
    register(CommandSpec {
        name: "persist",
        arity: Arity::Exact(1),
        handler: persist,
        keys: |args| (first_key(args), Vec::new()),
        mutating: true,
    });
    register(CommandSpec {
        name: "ttl",
        arity: Arity::Exact(1),
        handler: ttl,
        keys: |args| (Vec::new(), first_key(args)),
        mutating: false,
    });
    register(CommandSpec {
        name: "pttl",
        arity: Arity::Exact(1),
        handler: pttl,
        keys: |args| (Vec::new(), first_key(args)),
        mutating: false,
    });

    for (name, handler) in [
        ("expire", expire as super::Handler),
        ("pexpire", pexpire),
        ("expireat", expireat),
        ("pexpireat", pexpireat),
    ] {
        register(CommandSpec {
            name,
            arity: Arity::Exact(2),
            handler,
            keys: |args| (first_key(args), Vec::new()),
            mutating: true,
        });
    }
}

fn exists(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let count = args.iter().filter(|a| db.exists(&key_str(a))).count();
    Reply::Int(count as i64)
}

fn del(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let mut removed = 0;
    for arg in args {
        if db.remove(&key_str(arg)) {
            removed += 1;
            db.add_aof(aof_line("DEL", std::slice::from_ref(arg)));
        }
    }
    Reply::Int(removed)
}

fn type_cmd(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |e| e.type_name()) {
        Some(name) => Reply::Status(name.to_owned()),
        None => Reply::Status("none".to_owned()),
    }
}

fn rename_inner(db: &Arc<Database>, args: &[Bytes], fail_if_dst_exists: bool) -> Result<bool, Reply> {
    let src = key_str(&args[0]);
    let dst = key_str(&args[1]);

    let Some(entity) = db.get(&src) else {
        return Err(Reply::error(NO_SUCH_KEY));
    };
    if fail_if_dst_exists && db.exists(&dst) {
        return Ok(false);
    }

    let deadline = db.deadline_ms(&src);
    db.remove(&src);
    db.put(&dst, entity);
    if let Some(deadline) = deadline {
        db.expire_at(&dst, deadline);
    }
    Ok(true)
}

fn rename(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match rename_inner(db, args, false) {
        Ok(_) => {
            db.add_aof(aof_line("RENAME", args));
            Reply::Ok
        }
        Err(reply) => reply,
    }
}

fn renamenx(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match rename_inner(db, args, true) {
        Ok(true) => {
            db.add_aof(aof_line("RENAMENX", args));
            Reply::Int(1)
        }
        Ok(false) => Reply::Int(0),
        Err(reply) => reply,
    }
}

fn keys_cmd(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let pattern = key_str(&args[0]);
    let matched: Vec<Bytes> = db
        .keys()
        .into_iter()
        .filter(|k| glob_match(&pattern, k))
        .map(Bytes::from)
        .collect();
    Reply::bulk_array(matched)
}

fn dbsize(db: &Arc<Database>, _args: &[Bytes]) -> Reply {
    Reply::Int(db.key_count() as i64)
}

fn flushdb(db: &Arc<Database>, _args: &[Bytes]) -> Reply {
    db.flush();
    db.add_aof(aof_line("FLUSHDB", &[]));
    Reply::Ok
}

fn persist(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    if db.persist(&key_str(&args[0])) {
        db.add_aof(aof_line("PERSIST", args));
        Reply::Int(1)
    } else {
        Reply::Int(0)
    }
}

fn ttl(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.ttl_state(&key_str(&args[0])) {
        TtlState::Absent => Reply::Int(-2),
        TtlState::NoExpiry => Reply::Int(-1),
        // round up so a key about to expire never reports 0 prematurely
        TtlState::Remaining(ms) => Reply::Int(((ms + 999) / 1000) as i64),
    }
}

fn pttl(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.ttl_state(&key_str(&args[0])) {
        TtlState::Absent => Reply::Int(-2),
        TtlState::NoExpiry => Reply::Int(-1),
        TtlState::Remaining(ms) => Reply::Int(ms as i64),
    }
}

fn expire_to_deadline(db: &Arc<Database>, args: &[Bytes], deadline_ms: i64) -> Reply {
    let key = key_str(&args[0]);
    // a deadline in the past deletes immediately, like EXPIRE with 0
    if deadline_ms <= now_unix_ms() as i64 {
        return if db.remove(&key) {
            db.add_aof(aof_line("DEL", std::slice::from_ref(&args[0])));
            Reply::Int(1)
        } else {
            Reply::Int(0)
        };
    }
    if db.expire_at(&key, deadline_ms as u64) {
        aof_expire_at(db, &args[0], deadline_ms as u64);
        Reply::Int(1)
    } else {
        Reply::Int(0)
    }
}

fn expire(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Ok(secs) => expire_to_deadline(
            db,
            args,
            (now_unix_ms() as i64).saturating_add(secs.saturating_mul(1000)),
        ),
        Err(reply) => reply,
    }
}

fn pexpire(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Ok(ms) => expire_to_deadline(db, args, (now_unix_ms() as i64).saturating_add(ms)),
        Err(reply) => reply,
    }
}

fn expireat(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Ok(secs) => expire_to_deadline(db, args, secs.saturating_mul(1000)),
        Err(reply) => reply,
    }
}

fn pexpireat(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match parse_i64(&args[1]) {
        Ok(ms) => expire_to_deadline(db, args, ms),
        Err(reply) => reply,
    }
}
