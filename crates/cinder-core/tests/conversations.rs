//! Literal RESP conversations through the full dispatch path:
//! raw bytes → parser → engine → reply serialization → raw bytes.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use cinder_core::engine::{AofConfig, Engine, EngineConfig};
use cinder_core::ClientState;
use cinder_persistence::FsyncPolicy;
use cinder_protocol::parse_reply;

/// One client session against an engine, speaking raw RESP.
struct Session {
    engine: Arc<Engine>,
    client: ClientState,
}

impl Session {
    fn new(engine: &Arc<Engine>) -> Self {
        Self {
            engine: Arc::clone(engine),
            client: engine.new_client("test:0".into()),
        }
    }

    /// Feeds raw request bytes in, returns the raw reply bytes.
    fn send(&mut self, raw: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::from(raw);
        let mut out = BytesMut::new();
        while let Some((frame, consumed)) = parse_reply(&buf).expect("request must parse") {
            buf.advance(consumed);
            let argv = frame.into_cmd_line().expect("request must be a command array");
            let reply = self.engine.exec(&mut self.client, &argv);
            reply.serialize(&mut out);
        }
        assert!(buf.is_empty(), "partial request left in buffer");
        out.to_vec()
    }

    /// Convenience: send a command given as parts, return raw reply bytes.
    fn cmd(&mut self, parts: &[&str]) -> Vec<u8> {
        let mut raw = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            raw.extend_from_slice(format!("${}\r\n{part}\r\n", part.len()).as_bytes());
        }
        self.send(&raw)
    }
}

fn engine() -> Arc<Engine> {
    Engine::new(EngineConfig::default(), None).unwrap()
}

fn engine_with_pass(pass: &str) -> Arc<Engine> {
    Engine::new(
        EngineConfig {
            requirepass: Some(pass.into()),
            ..EngineConfig::default()
        },
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn auth_gate() {
    let engine = engine_with_pass("foo");
    let mut session = Session::new(&engine);

    assert_eq!(
        session.send(b"*1\r\n$4\r\nPING\r\n"),
        b"-NOAUTH Authentication required\r\n"
    );
    assert_eq!(
        session.send(b"*2\r\n$4\r\nAUTH\r\n$3\r\nfoo\r\n"),
        b"+OK\r\n"
    );
    assert_eq!(session.send(b"*1\r\n$4\r\nPING\r\n"), b"+PONG\r\n");
}

#[tokio::test]
async fn wrong_password_stays_locked_out() {
    let engine = engine_with_pass("foo");
    let mut session = Session::new(&engine);

    assert_eq!(
        session.cmd(&["AUTH", "bar"]),
        b"-ERR invalid password\r\n"
    );
    assert_eq!(
        session.cmd(&["GET", "k"]),
        b"-NOAUTH Authentication required\r\n"
    );
}

#[tokio::test]
async fn set_nx_xx_sequence() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["SET", "k", "v1", "NX"]), b"+OK\r\n");
    assert_eq!(session.cmd(&["SET", "k", "v2", "NX"]), b"$-1\r\n");
    assert_eq!(session.cmd(&["SET", "k", "v2", "XX"]), b"+OK\r\n");
    assert_eq!(session.cmd(&["GET", "k"]), b"$2\r\nv2\r\n");
}

#[tokio::test]
async fn set_xx_on_missing_key() {
    let engine = engine();
    let mut session = Session::new(&engine);
    assert_eq!(session.cmd(&["SET", "ghost", "v", "XX"]), b"$-1\r\n");
    assert_eq!(session.cmd(&["EXISTS", "ghost"]), b":0\r\n");
}

#[tokio::test]
async fn conflicting_set_options_are_syntax_errors() {
    let engine = engine();
    let mut session = Session::new(&engine);
    assert_eq!(session.cmd(&["SET", "k", "v", "NX", "XX"]), b"-ERR syntax error\r\n");
    assert_eq!(
        session.cmd(&["SET", "k", "v", "EX", "5", "PX", "100"]),
        b"-ERR syntax error\r\n"
    );
}

#[tokio::test]
async fn multi_exec_conversation() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["MULTI"]), b"+OK\r\n");
    assert_eq!(session.cmd(&["SET", "a", "1"]), b"+QUEUED\r\n");
    assert_eq!(session.cmd(&["INCR", "a"]), b"+QUEUED\r\n");
    assert_eq!(session.cmd(&["EXEC"]), b"*2\r\n+OK\r\n:2\r\n");
    assert_eq!(session.cmd(&["GET", "a"]), b"$1\r\n2\r\n");
}

#[tokio::test]
async fn discard_throws_the_queue_away() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["MULTI"]);
    session.cmd(&["SET", "a", "1"]);
    assert_eq!(session.cmd(&["DISCARD"]), b"+OK\r\n");
    assert_eq!(session.cmd(&["GET", "a"]), b"$-1\r\n");
    assert_eq!(session.cmd(&["EXEC"]), b"-ERR EXEC without MULTI\r\n");
}

#[tokio::test]
async fn dirty_transaction_aborts() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["MULTI"]);
    let reply = session.cmd(&["NOSUCHCMD", "x"]);
    assert!(reply.starts_with(b"-ERR unknown command"));
    session.cmd(&["SET", "a", "1"]);
    let reply = session.cmd(&["EXEC"]);
    assert!(reply.starts_with(b"-EXECABORT"));
    assert_eq!(session.cmd(&["GET", "a"]), b"$-1\r\n");
}

#[tokio::test]
async fn failing_command_mid_exec_rolls_back() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["SET", "a", "before"]);
    session.cmd(&["MULTI"]);
    session.cmd(&["SET", "a", "changed"]);
    session.cmd(&["LPUSH", "a", "x"]); // arity fine, type clash at run time
    let reply = session.cmd(&["EXEC"]);
    assert!(reply.starts_with(b"-EXECABORT"));
    // pre-transaction image restored
    assert_eq!(session.cmd(&["GET", "a"]), b"$6\r\nbefore\r\n");
}

#[tokio::test]
async fn select_inside_multi_is_rejected() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["MULTI"]);
    let reply = session.cmd(&["SELECT", "1"]);
    assert!(reply.starts_with(b"-ERR SELECT is not allowed"));
    let reply = session.cmd(&["EXEC"]);
    assert!(reply.starts_with(b"-EXECABORT"));
}

#[tokio::test]
async fn ttl_expiry_conversation() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["SET", "k", "v", "PX", "50"]), b"+OK\r\n");
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(session.cmd(&["GET", "k"]), b"$-1\r\n");
    assert_eq!(session.cmd(&["TTL", "k"]), b":-2\r\n");
}

#[tokio::test]
async fn ttl_reports_remaining_then_persist_clears() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["SET", "k", "v"]);
    assert_eq!(session.cmd(&["TTL", "k"]), b":-1\r\n");
    session.cmd(&["EXPIRE", "k", "100"]);
    let reply = session.cmd(&["TTL", "k"]);
    // between 1 and 100 seconds remain
    let secs: i64 = String::from_utf8_lossy(&reply[1..reply.len() - 2]).parse().unwrap();
    assert!((1..=100).contains(&secs), "unexpected ttl {secs}");

    assert_eq!(session.cmd(&["PERSIST", "k"]), b":1\r\n");
    assert_eq!(session.cmd(&["TTL", "k"]), b":-1\r\n");
}

#[tokio::test]
async fn wrongtype_conversation() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["SET", "k", "v"]);
    assert_eq!(
        session.cmd(&["LPUSH", "k", "x"]),
        b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"
    );
}

#[tokio::test]
async fn list_push_range_round_trip() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["LPUSH", "k", "a", "b", "c"]), b":3\r\n");
    assert_eq!(
        session.cmd(&["LRANGE", "k", "0", "-1"]),
        b"*3\r\n$1\r\nc\r\n$1\r\nb\r\n$1\r\na\r\n"
    );
    assert_eq!(session.cmd(&["LLEN", "k"]), b":3\r\n");
    assert_eq!(session.cmd(&["RPOP", "k"]), b"$1\r\na\r\n");
    assert_eq!(session.cmd(&["LPOP", "k"]), b"$1\r\nc\r\n");
}

#[tokio::test]
async fn popping_the_last_element_removes_the_key() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["RPUSH", "k", "only"]);
    session.cmd(&["RPOP", "k"]);
    assert_eq!(session.cmd(&["EXISTS", "k"]), b":0\r\n");
    assert_eq!(session.cmd(&["TYPE", "k"]), b"+none\r\n");
}

#[tokio::test]
async fn zadd_zrange_withscores_round_trip() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["ZADD", "k", "1", "a", "2", "b", "3", "c"]), b":3\r\n");
    assert_eq!(
        session.cmd(&["ZRANGE", "k", "0", "-1", "WITHSCORES"]),
        b"*6\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n$1\r\nc\r\n$1\r\n3\r\n"
    );
    assert_eq!(session.cmd(&["ZRANK", "k", "b"]), b":1\r\n");
    assert_eq!(session.cmd(&["ZSCORE", "k", "c"]), b"$1\r\n3\r\n");
}

#[tokio::test]
async fn zadd_incr_returns_score_and_respects_nx() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["ZADD", "k", "INCR", "5", "m"]), b"$1\r\n5\r\n");
    assert_eq!(session.cmd(&["ZADD", "k", "INCR", "2", "m"]), b"$1\r\n7\r\n");
    // NX + INCR on an existing member: precondition fails, nil reply
    assert_eq!(session.cmd(&["ZADD", "k", "NX", "INCR", "1", "m"]), b"$-1\r\n");
}

#[tokio::test]
async fn zrangebyscore_bounds() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["ZADD", "k", "1", "a", "2", "b", "3", "c"]);
    assert_eq!(
        session.cmd(&["ZRANGEBYSCORE", "k", "(1", "+inf"]),
        b"*2\r\n$1\r\nb\r\n$1\r\nc\r\n"
    );
    assert_eq!(
        session.cmd(&["ZRANGEBYSCORE", "k", "-inf", "2"]),
        b"*2\r\n$1\r\na\r\n$1\r\nb\r\n"
    );
}

#[tokio::test]
async fn empty_db_boundaries() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["DBSIZE"]), b":0\r\n");
    assert_eq!(session.cmd(&["KEYS", "*"]), b"*0\r\n");
    assert_eq!(session.cmd(&["INCR", "fresh"]), b":1\r\n");
}

#[tokio::test]
async fn incr_overflow_is_an_error_not_wraparound() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["SET", "k", "9223372036854775807"]);
    let reply = session.cmd(&["INCR", "k"]);
    assert!(reply.starts_with(b"-ERR"), "got {:?}", String::from_utf8_lossy(&reply));
    // value untouched
    assert_eq!(session.cmd(&["GET", "k"]), b"$19\r\n9223372036854775807\r\n");
}

#[tokio::test]
async fn incr_on_non_integer_errors() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["SET", "k", "notanumber"]);
    assert_eq!(
        session.cmd(&["INCR", "k"]),
        b"-ERR value is not an integer or out of range\r\n"
    );
}

#[tokio::test]
async fn select_isolates_databases() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["SET", "k", "db0"]);
    assert_eq!(session.cmd(&["SELECT", "1"]), b"+OK\r\n");
    assert_eq!(session.cmd(&["GET", "k"]), b"$-1\r\n");
    session.cmd(&["SET", "k", "db1"]);
    assert_eq!(session.cmd(&["SELECT", "0"]), b"+OK\r\n");
    assert_eq!(session.cmd(&["GET", "k"]), b"$3\r\ndb0\r\n");
    assert_eq!(session.cmd(&["SELECT", "99"]), b"-ERR DB index is out of range\r\n");
}

#[tokio::test]
async fn hash_and_set_round_trips() {
    let engine = engine();
    let mut session = Session::new(&engine);

    assert_eq!(session.cmd(&["HSET", "h", "f1", "v1", "f2", "v2"]), b":2\r\n");
    assert_eq!(session.cmd(&["HGET", "h", "f1"]), b"$2\r\nv1\r\n");
    assert_eq!(session.cmd(&["HLEN", "h"]), b":2\r\n");
    assert_eq!(session.cmd(&["HDEL", "h", "f1"]), b":1\r\n");
    assert_eq!(session.cmd(&["HEXISTS", "h", "f1"]), b":0\r\n");

    assert_eq!(session.cmd(&["SADD", "s", "a", "b", "a"]), b":2\r\n");
    assert_eq!(session.cmd(&["SCARD", "s"]), b":2\r\n");
    assert_eq!(session.cmd(&["SISMEMBER", "s", "a"]), b":1\r\n");
    assert_eq!(session.cmd(&["SREM", "s", "a", "b"]), b":2\r\n");
    assert_eq!(session.cmd(&["EXISTS", "s"]), b":0\r\n");
}

#[tokio::test]
async fn rename_carries_value_and_ttl() {
    let engine = engine();
    let mut session = Session::new(&engine);

    session.cmd(&["SET", "src", "v"]);
    session.cmd(&["EXPIRE", "src", "100"]);
    assert_eq!(session.cmd(&["RENAME", "src", "dst"]), b"+OK\r\n");
    assert_eq!(session.cmd(&["EXISTS", "src"]), b":0\r\n");
    assert_eq!(session.cmd(&["GET", "dst"]), b"$1\r\nv\r\n");
    let ttl = session.cmd(&["TTL", "dst"]);
    assert_ne!(ttl, b":-1\r\n");
    assert_ne!(ttl, b":-2\r\n");

    assert_eq!(
        session.cmd(&["RENAME", "ghost", "x"]),
        b"-ERR no such key\r\n"
    );
}

#[tokio::test]
async fn pipelined_commands_in_one_buffer() {
    let engine = engine();
    let mut session = Session::new(&engine);

    let out = session.send(
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n*1\r\n$6\r\nDBSIZE\r\n",
    );
    assert_eq!(out, b"+OK\r\n$1\r\nv\r\n:1\r\n");
}

#[tokio::test]
async fn unknown_command_and_arity_errors() {
    let engine = engine();
    let mut session = Session::new(&engine);

    let reply = session.cmd(&["FROBNICATE"]);
    assert!(reply.starts_with(b"-ERR unknown command"));

    assert_eq!(
        session.cmd(&["GET"]),
        b"-ERR wrong number of arguments for 'get' command\r\n"
    );
    assert_eq!(
        session.cmd(&["SET", "k"]),
        b"-ERR wrong number of arguments for 'set' command\r\n"
    );
}

// ---------------------------------------------------------------------
// persistence round trips
// ---------------------------------------------------------------------

fn engine_with_aof(path: &std::path::Path) -> Arc<Engine> {
    Engine::new(
        EngineConfig {
            aof: Some(AofConfig {
                path: path.to_path_buf(),
                fsync: FsyncPolicy::Always,
            }),
            ..EngineConfig::default()
        },
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn aof_replay_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");

    {
        let engine = engine_with_aof(&path);
        let mut session = Session::new(&engine);
        session.cmd(&["SET", "s", "string"]);
        session.cmd(&["RPUSH", "l", "a", "b", "c"]);
        session.cmd(&["HSET", "h", "f", "v"]);
        session.cmd(&["SADD", "set", "m1", "m2"]);
        session.cmd(&["ZADD", "z", "1.5", "m"]);
        session.cmd(&["SELECT", "2"]);
        session.cmd(&["SET", "other", "db2"]);
        session.cmd(&["SELECT", "0"]);
        session.cmd(&["DEL", "set"]);
        engine.close();
    }

    let engine = engine_with_aof(&path);
    let mut session = Session::new(&engine);
    assert_eq!(session.cmd(&["GET", "s"]), b"$6\r\nstring\r\n");
    assert_eq!(
        session.cmd(&["LRANGE", "l", "0", "-1"]),
        b"*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n"
    );
    assert_eq!(session.cmd(&["HGET", "h", "f"]), b"$1\r\nv\r\n");
    assert_eq!(session.cmd(&["EXISTS", "set"]), b":0\r\n");
    assert_eq!(session.cmd(&["ZSCORE", "z", "m"]), b"$3\r\n1.5\r\n");
    session.cmd(&["SELECT", "2"]);
    assert_eq!(session.cmd(&["GET", "other"]), b"$3\r\ndb2\r\n");
    engine.close();
}

#[tokio::test]
async fn aof_records_absolute_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ttl.aof");

    {
        let engine = engine_with_aof(&path);
        let mut session = Session::new(&engine);
        session.cmd(&["SET", "short", "v", "PX", "40"]);
        session.cmd(&["SET", "long", "v", "EX", "1000"]);
        engine.close();
    }

    tokio::time::sleep(Duration::from_millis(80)).await;

    let engine = engine_with_aof(&path);
    let mut session = Session::new(&engine);
    // the short deadline passed while the server was down
    assert_eq!(session.cmd(&["GET", "short"]), b"$-1\r\n");
    assert_eq!(session.cmd(&["GET", "long"]), b"$1\r\nv\r\n");
    let ttl = session.cmd(&["TTL", "long"]);
    assert_ne!(ttl, b":-1\r\n");
    engine.close();
}

#[tokio::test]
async fn rewrite_then_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rewrite.aof");

    {
        let engine = engine_with_aof(&path);
        let mut session = Session::new(&engine);
        session.cmd(&["SET", "a", "1"]);
        session.cmd(&["SET", "a", "2"]);
        session.cmd(&["RPUSH", "l", "x"]);
        session.cmd(&["RPUSH", "l", "y"]);
        session.cmd(&["DEL", "a"]);
        session.cmd(&["SET", "b", "kept"]);

        let reply = session.cmd(&["BGREWRITEAOF"]);
        assert!(reply.starts_with(b"+Background"));
        // the rewrite runs on a blocking task; give it a beat
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.close();
    }

    let engine = engine_with_aof(&path);
    let mut session = Session::new(&engine);
    assert_eq!(session.cmd(&["GET", "b"]), b"$4\r\nkept\r\n");
    assert_eq!(session.cmd(&["EXISTS", "a"]), b":0\r\n");
    assert_eq!(
        session.cmd(&["LRANGE", "l", "0", "-1"]),
        b"*2\r\n$1\r\nx\r\n$1\r\ny\r\n"
    );
    assert_eq!(session.cmd(&["DBSIZE"]), b":2\r\n");
    engine.close();
}
