//! Command registry and dispatch.
//!
//! Every data command is a [`CommandSpec`]: a handler function plus the
//! metadata the dispatcher and the cluster router need: arity, the keys it
//! writes and reads, and whether it mutates. Dispatch validates arity,
//! acquires the declared keys through the database's lock table in global
//! order, and runs the handler. The EXEC path acquires the union of a whole
//! transaction's keys up front and then runs handlers through
//! [`CommandRegistry::dispatch_unlocked`].

mod glob;
mod hashes;
mod keyspace;
mod lists;
mod sets;
mod strings;
mod zsets;

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use cinder_protocol::{CmdLine, Reply};

use crate::database::Database;

pub use glob::glob_match;

/// WRONGTYPE message, verbatim redis wording.
pub const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
/// Integer parse/overflow failure message.
pub const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";
/// Float parse failure message.
pub const NOT_A_FLOAT: &str = "ERR value is not a valid float";
/// Generic option-combination failure.
pub const SYNTAX_ERROR: &str = "ERR syntax error";
/// RENAME and friends on a missing source.
pub const NO_SUCH_KEY: &str = "ERR no such key";

/// Argument-count contract, counted without the command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn admits(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(want) => n == want,
            Arity::AtLeast(min) => n >= min,
        }
    }
}

/// Handler: executes against one database with the command name stripped.
pub type Handler = fn(&Arc<Database>, &[Bytes]) -> Reply;

/// Extracts the keys a command will write and read from its args.
pub type KeysFn = fn(&[Bytes]) -> (Vec<String>, Vec<String>);

/// Descriptor for one command.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: Arity,
    pub handler: Handler,
    pub keys: KeysFn,
    /// Whether a successful run can change the keyspace. The cluster
    /// router forwards mutations away from MovingOut slots based on this.
    pub mutating: bool,
}

/// Case-insensitive name → descriptor table.
pub struct CommandRegistry {
    entries: AHashMap<&'static str, CommandSpec>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    /// Builds the full table.
    pub fn new() -> Self {
        let mut entries = AHashMap::new();
        let mut register = |spec: CommandSpec| {
            entries.insert(spec.name, spec);
        };
        keyspace::register_all(&mut register);
        strings::register_all(&mut register);
        lists::register_all(&mut register);
        hashes::register_all(&mut register);
        sets::register_all(&mut register);
        zsets::register_all(&mut register);
        Self { entries }
    }

    /// Looks up a descriptor by lowercase name.
    pub fn get(&self, lowercase_name: &str) -> Option<&CommandSpec> {
        self.entries.get(lowercase_name)
    }

    /// Validates name and arity without executing. Returns the spec.
    pub fn validate<'a>(
        &'a self,
        lowercase_name: &str,
        args: &[Bytes],
    ) -> Result<&'a CommandSpec, Reply> {
        let spec = self.get(lowercase_name).ok_or_else(|| {
            Reply::error(format!("ERR unknown command '{lowercase_name}'"))
        })?;
        if !spec.arity.admits(args.len()) {
            return Err(Reply::arity_error(spec.name));
        }
        Ok(spec)
    }

    /// Full dispatch: validate, lock declared keys in global order, run.
    pub fn dispatch(&self, db: &Arc<Database>, lowercase_name: &str, args: &[Bytes]) -> Reply {
        let spec = match self.validate(lowercase_name, args) {
            Ok(spec) => spec,
            Err(reply) => return reply,
        };
        let (write_keys, read_keys) = (spec.keys)(args);
        let _guard = db.locks.lock(&write_keys, &read_keys);
        (spec.handler)(db, args)
    }

    /// Dispatch for callers that already hold the relevant locks (EXEC).
    pub fn dispatch_unlocked(
        &self,
        db: &Arc<Database>,
        lowercase_name: &str,
        args: &[Bytes],
    ) -> Reply {
        match self.validate(lowercase_name, args) {
            Ok(spec) => (spec.handler)(db, args),
            Err(reply) => reply,
        }
    }
}

// ---------------------------------------------------------------------------
// shared helpers for handler modules
// ---------------------------------------------------------------------------

/// Keys are stored as strings; command arguments arrive as raw bytes.
pub(crate) fn key_str(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

/// keys fn: single key at args\[0\].
pub(crate) fn first_key(args: &[Bytes]) -> Vec<String> {
    args.first().map(|a| vec![key_str(a)]).unwrap_or_default()
}

/// keys fn: every arg is a key.
pub(crate) fn all_keys(args: &[Bytes]) -> Vec<String> {
    args.iter().map(key_str).collect()
}

/// keys fn: args at even offsets are keys (MSET-style pair lists).
pub(crate) fn paired_keys(args: &[Bytes]) -> Vec<String> {
    args.iter().step_by(2).map(key_str).collect()
}

pub(crate) fn no_keys(_args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

/// Parses an argument as a signed 64-bit integer.
pub(crate) fn parse_i64(arg: &Bytes) -> Result<i64, Reply> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Reply::error(NOT_AN_INTEGER))
}

/// Parses an argument as an IEEE-754 binary64 float.
pub(crate) fn parse_f64(arg: &Bytes) -> Result<f64, Reply> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or_else(|| Reply::error(NOT_A_FLOAT))
}

/// Formats a float the way redis replies do: no exponent, no trailing
/// zeros, `17` significant digits preserved by Rust's shortest round-trip.
pub(crate) fn format_f64(val: f64) -> String {
    if val == val.trunc() && val.abs() < 1e17 {
        format!("{}", val as i64)
    } else {
        format!("{val}")
    }
}

/// Rebuilds the canonical argv for an AOF record.
pub(crate) fn aof_line(name: &str, args: &[Bytes]) -> CmdLine {
    let mut line = Vec::with_capacity(args.len() + 1);
    line.push(Bytes::copy_from_slice(name.as_bytes()));
    line.extend(args.iter().cloned());
    line
}

/// Emits the canonical absolute-deadline expiry record for a key.
pub(crate) fn aof_expire_at(db: &Database, key: &Bytes, deadline_ms: u64) {
    db.add_aof(vec![
        Bytes::from_static(b"PEXPIREAT"),
        key.clone(),
        Bytes::from(deadline_ms.to_string()),
    ]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_required_commands() {
        let reg = CommandRegistry::new();
        for name in [
            "get", "set", "setnx", "setex", "mget", "mset", "msetnx", "getset", "incr", "decr",
            "incrby", "decrby", "incrbyfloat", "strlen", "append", "exists", "del", "type",
            "rename", "renamenx", "keys", "expire", "pexpire", "expireat", "pexpireat", "ttl",
            "pttl", "persist", "dbsize", "flushdb", "lpush", "rpush", "lpop", "rpop", "llen",
            "lindex", "lset", "lrange", "lrem", "linsert", "hset", "hget", "hdel", "hexists",
            "hlen", "hkeys", "hvals", "hgetall", "hmset", "hmget", "hincrby", "hincrbyfloat",
            "sadd", "srem", "sismember", "smembers", "scard", "sinter", "sunion", "sdiff",
            "zadd", "zscore", "zrange", "zrangebyscore", "zrank", "zrem", "zcard", "zincrby",
        ] {
            assert!(reg.get(name).is_some(), "missing command {name}");
        }
    }

    #[test]
    fn unknown_and_arity_failures() {
        let reg = CommandRegistry::new();
        let err = reg.validate("nope", &[]).unwrap_err();
        assert!(matches!(err, Reply::Err(msg) if msg.contains("unknown command")));

        let err = reg.validate("get", &[]).unwrap_err();
        assert!(matches!(err, Reply::Err(msg) if msg.contains("wrong number of arguments")));
    }

    #[test]
    fn float_formatting() {
        assert_eq!(format_f64(3.0), "3");
        assert_eq!(format_f64(3.5), "3.5");
        assert_eq!(format_f64(-0.25), "-0.25");
        assert_eq!(format_f64(10.5 + 0.1), "10.6");
    }

    #[test]
    fn integer_parsing_rejects_garbage() {
        assert!(parse_i64(&Bytes::from_static(b"12")).is_ok());
        assert!(parse_i64(&Bytes::from_static(b"12.5")).is_err());
        assert!(parse_i64(&Bytes::from_static(b"abc")).is_err());
        assert!(parse_i64(&Bytes::from_static(b"")).is_err());
    }
}
