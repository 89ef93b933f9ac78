//! Direct-to-buffer RESP serialization.
//!
//! Writes replies into a `BytesMut` with no intermediate allocations;
//! integers format through `itoa` onto the stack.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::Reply;

impl Reply {
    /// Serializes this reply into the provided buffer, including the type
    /// prefix and trailing CRLF delimiters. `NoReply` writes nothing.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Err(msg) => {
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Int(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                dst.put_u8(b'$');
                write_i64(data.len() as i64, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Reply::MultiBulk(items) => {
                dst.put_u8(b'*');
                write_i64(items.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
            Reply::NullBulk => dst.put_slice(b"$-1\r\n"),
            Reply::NullMultiBulk => dst.put_slice(b"*-1\r\n"),
            Reply::EmptyMultiBulk => dst.put_slice(b"*0\r\n"),
            Reply::Ok => dst.put_slice(b"+OK\r\n"),
            Reply::Pong => dst.put_slice(b"+PONG\r\n"),
            Reply::Queued => dst.put_slice(b"+QUEUED\r\n"),
            Reply::NoReply => {}
            Reply::Unknown => dst.put_slice(b"-ERR unknown\r\n"),
        }
    }

    /// Serializes into a freshly allocated `Bytes`.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize(&mut buf);
        buf.freeze()
    }
}

/// Serializes a command line as the RESP array a client would send.
/// Used by the AOF writer and peer forwarding.
pub fn serialize_cmd_line(line: &[Bytes], dst: &mut BytesMut) {
    dst.put_u8(b'*');
    write_i64(line.len() as i64, dst);
    dst.put_slice(b"\r\n");
    for arg in line {
        dst.put_u8(b'$');
        write_i64(arg.len() as i64, dst);
        dst.put_slice(b"\r\n");
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_reply;

    fn serialize(reply: &Reply) -> Vec<u8> {
        let mut buf = BytesMut::new();
        reply.serialize(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn fixed_variants() {
        assert_eq!(serialize(&Reply::Ok), b"+OK\r\n");
        assert_eq!(serialize(&Reply::Pong), b"+PONG\r\n");
        assert_eq!(serialize(&Reply::Queued), b"+QUEUED\r\n");
        assert_eq!(serialize(&Reply::NullBulk), b"$-1\r\n");
        assert_eq!(serialize(&Reply::NullMultiBulk), b"*-1\r\n");
        assert_eq!(serialize(&Reply::EmptyMultiBulk), b"*0\r\n");
        assert_eq!(serialize(&Reply::Unknown), b"-ERR unknown\r\n");
    }

    #[test]
    fn no_reply_writes_nothing() {
        assert!(serialize(&Reply::NoReply).is_empty());
    }

    #[test]
    fn status_and_error() {
        assert_eq!(serialize(&Reply::Status("master".into())), b"+master\r\n");
        assert_eq!(serialize(&Reply::Err("ERR bad".into())), b"-ERR bad\r\n");
    }

    #[test]
    fn integers() {
        assert_eq!(serialize(&Reply::Int(42)), b":42\r\n");
        assert_eq!(serialize(&Reply::Int(-7)), b":-7\r\n");
    }

    #[test]
    fn bulk() {
        assert_eq!(
            serialize(&Reply::Bulk(Bytes::from_static(b"hello"))),
            b"$5\r\nhello\r\n"
        );
        assert_eq!(serialize(&Reply::Bulk(Bytes::new())), b"$0\r\n\r\n");
    }

    #[test]
    fn multi_bulk() {
        let reply = Reply::MultiBulk(vec![Reply::Ok, Reply::Int(1)]);
        assert_eq!(serialize(&reply), b"*2\r\n+OK\r\n:1\r\n");
    }

    #[test]
    fn cmd_line_round_trip() {
        let line = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")];
        let mut buf = BytesMut::new();
        serialize_cmd_line(&line, &mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");

        let (parsed, _) = parse_reply(&buf).unwrap().unwrap();
        assert_eq!(parsed.into_cmd_line().unwrap(), line);
    }

    #[test]
    fn round_trip_all_variants() {
        let replies = vec![
            Reply::Status("x".into()),
            Reply::Err("ERR nope".into()),
            Reply::Int(i64::MIN),
            Reply::Bulk(Bytes::from_static(b"binary\x00data")),
            Reply::MultiBulk(vec![Reply::Int(1), Reply::NullBulk, Reply::Pong]),
            Reply::NullBulk,
            Reply::NullMultiBulk,
            Reply::EmptyMultiBulk,
            Reply::Ok,
            Reply::Pong,
            Reply::Queued,
        ];

        for original in &replies {
            let mut buf = BytesMut::new();
            original.serialize(&mut buf);
            let (parsed, consumed) = parse_reply(&buf)
                .expect("round-trip should parse")
                .expect("round-trip should yield a reply");
            assert_eq!(&parsed, original, "round-trip failed for {original:?}");
            assert_eq!(consumed, buf.len());
        }
    }
}
