//! Sorted-set commands.

use std::sync::Arc;

use bytes::Bytes;
use cinder_protocol::Reply;

use crate::database::Database;
use crate::types::{normalize_range, AddOutcome, Entity, ScoreBound, SortedSet};

use super::{
    aof_line, first_key, format_f64, key_str, parse_f64, parse_i64, Arity, CommandSpec,
    SYNTAX_ERROR, WRONGTYPE,
};

pub(super) fn register_all(register: &mut impl FnMut(CommandSpec)) {
    let single_write = |args: &[Bytes]| (first_key(args), Vec::new());
    let single_read = |args: &[Bytes]| (Vec::new(), first_key(args));

    register(CommandSpec {
        name: "zadd",
        arity: Arity::AtLeast(3),
        handler: zadd,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "zscore",
        arity: Arity::Exact(2),
        handler: zscore,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "zrange",
        arity: Arity::AtLeast(3),
        handler: zrange,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "zrangebyscore",
        arity: Arity::AtLeast(3),
        handler: zrangebyscore,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "zrank",
        arity: Arity::Exact(2),
        handler: zrank,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "zrem",
        arity: Arity::AtLeast(2),
        handler: zrem,
        keys: single_write,
        mutating: true,
    });
    register(CommandSpec {
        name: "zcard",
        arity: Arity::Exact(1),
        handler: zcard,
        keys: single_read,
        mutating: false,
    });
    register(CommandSpec {
        name: "zincrby",
        arity: Arity::Exact(3),
        handler: zincrby,
        keys: single_write,
        mutating: true,
    });
}

#[derive(Default)]
struct ZAddOptions {
    nx: bool,
    xx: bool,
    ch: bool,
    incr: bool,
}

/// Parses leading ZADD flags, returning the options and the offset where
/// score/member pairs begin.
fn parse_zadd_options(args: &[Bytes]) -> Result<(ZAddOptions, usize), Reply> {
    let mut opts = ZAddOptions::default();
    let mut i = 1;
    while i < args.len() {
        match key_str(&args[i]).to_ascii_uppercase().as_str() {
            "NX" => opts.nx = true,
            "XX" => opts.xx = true,
            "CH" => opts.ch = true,
            "INCR" => opts.incr = true,
            _ => break,
        }
        i += 1;
    }
    if opts.nx && opts.xx {
        return Err(Reply::error(
            "ERR XX and NX options at the same time are not compatible",
        ));
    }
    Ok((opts, i))
}

fn zadd(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let (opts, offset) = match parse_zadd_options(args) {
        Ok(parsed) => parsed,
        Err(reply) => return reply,
    };
    let pairs = &args[offset..];
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return Reply::error(SYNTAX_ERROR);
    }
    if opts.incr && pairs.len() != 2 {
        return Reply::error("ERR INCR option supports a single increment-element pair");
    }

    let mut members = Vec::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks_exact(2) {
        let score = match parse_f64(&pair[0]) {
            Ok(s) => s,
            Err(reply) => return reply,
        };
        members.push((score, key_str(&pair[1])));
    }

    let key = key_str(&args[0]);

    if opts.incr {
        let (score, member) = members.into_iter().next().expect("one pair checked above");
        let outcome = db.modify_or_insert(
            &key,
            || Entity::ZSet(SortedSet::new()),
            |entity| match entity {
                Entity::ZSet(zset) => {
                    let exists = zset.score(&member).is_some();
                    if (opts.nx && exists) || (opts.xx && !exists) {
                        return Ok(None);
                    }
                    Ok(zset.incr(&member, score))
                }
                _ => Err(()),
            },
        );
        return match outcome {
            Ok(Some(new_score)) => {
                db.add_aof(vec![
                    Bytes::from_static(b"ZADD"),
                    args[0].clone(),
                    Bytes::from(format_f64(new_score)),
                    Bytes::from(member),
                ]);
                Reply::Bulk(Bytes::from(format_f64(new_score)))
            }
            Ok(None) => Reply::NullBulk,
            Err(()) => Reply::error(WRONGTYPE),
        };
    }

    let result = db.modify_or_insert(
        &key,
        || Entity::ZSet(SortedSet::new()),
        |entity| match entity {
            Entity::ZSet(zset) => {
                let mut added = 0i64;
                let mut changed = 0i64;
                for (score, member) in &members {
                    match zset.add(member, *score, opts.nx, opts.xx) {
                        AddOutcome::Added => {
                            added += 1;
                            changed += 1;
                        }
                        AddOutcome::Updated => changed += 1,
                        AddOutcome::Unchanged => {}
                    }
                }
                Ok((added, changed))
            }
            _ => Err(()),
        },
    );

    match result {
        Ok((added, changed)) => {
            if changed > 0 {
                db.add_aof(aof_line("ZADD", args));
            }
            Reply::Int(if opts.ch { changed } else { added })
        }
        Err(()) => Reply::error(WRONGTYPE),
    }
}

fn zscore(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::ZSet(zset) => Ok(zset.score(&key_str(&args[1]))),
        _ => Err(()),
    }) {
        Some(Ok(Some(score))) => Reply::Bulk(Bytes::from(format_f64(score))),
        Some(Ok(None)) => Reply::NullBulk,
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::NullBulk,
    }
}

/// Appends members (and scores, when requested) as bulk replies.
fn members_reply(members: Vec<(String, f64)>, with_scores: bool) -> Reply {
    if members.is_empty() {
        return Reply::EmptyMultiBulk;
    }
    let mut items = Vec::with_capacity(members.len() * if with_scores { 2 } else { 1 });
    for (member, score) in members {
        items.push(Reply::Bulk(Bytes::from(member)));
        if with_scores {
            items.push(Reply::Bulk(Bytes::from(format_f64(score))));
        }
    }
    Reply::MultiBulk(items)
}

fn zrange(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let (start, stop) = match (parse_i64(&args[1]), parse_i64(&args[2])) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    let with_scores = match args.get(3) {
        None => false,
        Some(flag) if key_str(flag).eq_ignore_ascii_case("WITHSCORES") => true,
        Some(_) => return Reply::error(SYNTAX_ERROR),
    };
    if args.len() > 4 {
        return Reply::error(SYNTAX_ERROR);
    }

    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::ZSet(zset) => {
            let (lo, hi) = normalize_range(start, stop, zset.len());
            Ok(zset
                .range_by_rank(lo, hi)
                .into_iter()
                .map(|(m, s)| (m.to_owned(), s))
                .collect::<Vec<_>>())
        }
        _ => Err(()),
    }) {
        Some(Ok(members)) => members_reply(members, with_scores),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::EmptyMultiBulk,
    }
}

/// Parses a ZRANGEBYSCORE bound: `-inf`, `+inf`, `(score`, or `score`.
fn parse_score_bound(arg: &Bytes) -> Result<ScoreBound, Reply> {
    let raw = key_str(arg);
    let lower = raw.to_ascii_lowercase();
    if lower == "-inf" || lower == "+inf" || lower == "inf" {
        return Ok(ScoreBound::Infinite);
    }
    if let Some(rest) = raw.strip_prefix('(') {
        return rest
            .parse::<f64>()
            .map(ScoreBound::Exclusive)
            .map_err(|_| Reply::error("ERR min or max is not a float"));
    }
    raw.parse::<f64>()
        .map(ScoreBound::Inclusive)
        .map_err(|_| Reply::error("ERR min or max is not a float"))
}

fn zrangebyscore(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let min = match parse_score_bound(&args[1]) {
        Ok(b) => b,
        Err(reply) => return reply,
    };
    let max = match parse_score_bound(&args[2]) {
        Ok(b) => b,
        Err(reply) => return reply,
    };
    let with_scores = match args.get(3) {
        None => false,
        Some(flag) if key_str(flag).eq_ignore_ascii_case("WITHSCORES") => true,
        Some(_) => return Reply::error(SYNTAX_ERROR),
    };
    if args.len() > 4 {
        return Reply::error(SYNTAX_ERROR);
    }

    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::ZSet(zset) => Ok(zset
            .range_by_score(min, max)
            .into_iter()
            .map(|(m, s)| (m.to_owned(), s))
            .collect::<Vec<_>>()),
        _ => Err(()),
    }) {
        Some(Ok(members)) => members_reply(members, with_scores),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::EmptyMultiBulk,
    }
}

fn zrank(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::ZSet(zset) => Ok(zset.rank(&key_str(&args[1]))),
        _ => Err(()),
    }) {
        Some(Ok(Some(rank))) => Reply::Int(rank as i64),
        Some(Ok(None)) => Reply::NullBulk,
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::NullBulk,
    }
}

fn zrem(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let key = key_str(&args[0]);
    let result = db.modify(&key, |entity| match entity {
        Entity::ZSet(zset) => {
            let removed = args[1..]
                .iter()
                .filter(|m| zset.remove(&key_str(m)))
                .count();
            Ok((removed, zset.is_empty()))
        }
        _ => Err(()),
    });
    match result {
        Some(Ok((removed, emptied))) => {
            if emptied {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(aof_line("ZREM", args));
            }
            Reply::Int(removed as i64)
        }
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn zcard(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    match db.view(&key_str(&args[0]), |entity| match entity {
        Entity::ZSet(zset) => Ok(zset.len() as i64),
        _ => Err(()),
    }) {
        Some(Ok(len)) => Reply::Int(len),
        Some(Err(())) => Reply::error(WRONGTYPE),
        None => Reply::Int(0),
    }
}

fn zincrby(db: &Arc<Database>, args: &[Bytes]) -> Reply {
    let delta = match parse_f64(&args[1]) {
        Ok(d) => d,
        Err(reply) => return reply,
    };
    let member = key_str(&args[2]);
    let key = key_str(&args[0]);

    let outcome = db.modify_or_insert(
        &key,
        || Entity::ZSet(SortedSet::new()),
        |entity| match entity {
            Entity::ZSet(zset) => Ok(zset.incr(&member, delta)),
            _ => Err(()),
        },
    );

    match outcome {
        Ok(Some(new_score)) => {
            db.add_aof(vec![
                Bytes::from_static(b"ZADD"),
                args[0].clone(),
                Bytes::from(format_f64(new_score)),
                args[2].clone(),
            ]);
            Reply::Bulk(Bytes::from(format_f64(new_score)))
        }
        Ok(None) => Reply::error("ERR resulting score is not a number (NaN)"),
        Err(()) => Reply::error(WRONGTYPE),
    }
}
