//! Entity wire encoding for slot migration.
//!
//! When an importing node needs a key it hasn't pulled yet, it asks the
//! old owner with the internal `dumpkey` command. The answer is a
//! multi-bulk: type tag, expiry deadline (`0` = none), then the
//! type-specific payload, all as bulk strings so it travels over the same
//! RESP channel as everything else.

use bytes::Bytes;
use cinder_core::types::{Entity, QuickList, SortedSet};
use cinder_protocol::Reply;

use crate::error::ClusterError;

/// Encodes an entity (plus its deadline) as a dump reply.
pub fn dump_reply(entity: &Entity, deadline_ms: Option<u64>) -> Reply {
    let mut items = vec![
        Reply::Bulk(Bytes::from_static(entity.type_name().as_bytes())),
        Reply::Bulk(Bytes::from(deadline_ms.unwrap_or(0).to_string())),
    ];
    match entity {
        Entity::String(data) => items.push(Reply::Bulk(data.clone())),
        Entity::List(list) => {
            items.extend(list.iter().cloned().map(Reply::Bulk));
        }
        Entity::Hash(map) => {
            for (field, value) in map {
                items.push(Reply::Bulk(field.clone()));
                items.push(Reply::Bulk(value.clone()));
            }
        }
        Entity::Set(set) => {
            items.extend(set.iter().cloned().map(Reply::Bulk));
        }
        Entity::ZSet(zset) => {
            for (member, score) in zset.iter() {
                items.push(Reply::Bulk(Bytes::copy_from_slice(member.as_bytes())));
                items.push(Reply::Bulk(Bytes::from(score.to_string())));
            }
        }
    }
    Reply::MultiBulk(items)
}

/// Decodes a dump reply back into an entity and optional deadline.
pub fn load_dump(reply: Reply) -> Result<(Entity, Option<u64>), ClusterError> {
    let items = match reply {
        Reply::MultiBulk(items) => items,
        other => return Err(ClusterError::BadDump(format!("not a dump array: {other:?}"))),
    };
    if items.len() < 2 {
        return Err(ClusterError::BadDump("dump too short".into()));
    }

    let mut bulks = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Reply::Bulk(b) => bulks.push(b),
            other => {
                return Err(ClusterError::BadDump(format!(
                    "non-bulk dump element: {other:?}"
                )))
            }
        }
    }

    let kind = String::from_utf8_lossy(&bulks[0]).into_owned();
    let deadline: u64 = String::from_utf8_lossy(&bulks[1])
        .parse()
        .map_err(|_| ClusterError::BadDump("bad deadline".into()))?;
    let deadline = (deadline != 0).then_some(deadline);
    let payload = &bulks[2..];

    let entity = match kind.as_str() {
        "string" => {
            let Some(data) = payload.first() else {
                return Err(ClusterError::BadDump("string dump missing value".into()));
            };
            Entity::String(data.clone())
        }
        "list" => {
            let mut list = QuickList::new();
            for item in payload {
                list.push_back(item.clone());
            }
            Entity::List(list)
        }
        "hash" => {
            if payload.len() % 2 != 0 {
                return Err(ClusterError::BadDump("odd hash dump".into()));
            }
            Entity::Hash(
                payload
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect(),
            )
        }
        "set" => Entity::Set(payload.iter().cloned().collect()),
        "zset" => {
            if payload.len() % 2 != 0 {
                return Err(ClusterError::BadDump("odd zset dump".into()));
            }
            let mut zset = SortedSet::new();
            for pair in payload.chunks_exact(2) {
                let member = String::from_utf8_lossy(&pair[0]).into_owned();
                let score: f64 = String::from_utf8_lossy(&pair[1])
                    .parse()
                    .map_err(|_| ClusterError::BadDump("bad zset score".into()))?;
                zset.add(&member, score, false, false);
            }
            Entity::ZSet(zset)
        }
        other => return Err(ClusterError::BadDump(format!("unknown kind '{other}'"))),
    };
    Ok((entity, deadline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::{AHashMap, AHashSet};

    fn round_trip(entity: Entity, deadline: Option<u64>) -> (Entity, Option<u64>) {
        load_dump(dump_reply(&entity, deadline)).unwrap()
    }

    #[test]
    fn string_round_trip() {
        let (entity, deadline) =
            round_trip(Entity::String(Bytes::from_static(b"hello")), Some(1234));
        assert!(matches!(entity, Entity::String(b) if &b[..] == b"hello"));
        assert_eq!(deadline, Some(1234));
    }

    #[test]
    fn list_round_trip_preserves_order() {
        let mut list = QuickList::new();
        for s in ["a", "b", "c"] {
            list.push_back(Bytes::copy_from_slice(s.as_bytes()));
        }
        let (entity, deadline) = round_trip(Entity::List(list), None);
        assert_eq!(deadline, None);
        match entity {
            Entity::List(list) => {
                let vals: Vec<_> = list.iter().map(|b| b.clone()).collect();
                assert_eq!(vals, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
            }
            other => panic!("wrong kind: {}", other.type_name()),
        }
    }

    #[test]
    fn hash_and_set_round_trip() {
        let mut map = AHashMap::new();
        map.insert(Bytes::from_static(b"f"), Bytes::from_static(b"v"));
        let (entity, _) = round_trip(Entity::Hash(map), None);
        assert!(matches!(entity, Entity::Hash(m) if m.len() == 1));

        let mut set = AHashSet::new();
        set.insert(Bytes::from_static(b"m"));
        let (entity, _) = round_trip(Entity::Set(set), None);
        assert!(matches!(entity, Entity::Set(s) if s.contains(&Bytes::from_static(b"m"))));
    }

    #[test]
    fn zset_round_trip_preserves_scores() {
        let mut zset = SortedSet::new();
        zset.add("a", 1.5, false, false);
        zset.add("b", -2.0, false, false);
        let (entity, _) = round_trip(Entity::ZSet(zset), None);
        match entity {
            Entity::ZSet(z) => {
                assert_eq!(z.score("a"), Some(1.5));
                assert_eq!(z.score("b"), Some(-2.0));
            }
            other => panic!("wrong kind: {}", other.type_name()),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(load_dump(Reply::Int(3)).is_err());
        assert!(load_dump(Reply::MultiBulk(vec![Reply::Bulk(Bytes::from_static(b"string"))])).is_err());
        let bad_kind = Reply::MultiBulk(vec![
            Reply::Bulk(Bytes::from_static(b"stream")),
            Reply::Bulk(Bytes::from_static(b"0")),
        ]);
        assert!(load_dump(bad_kind).is_err());
    }
}
