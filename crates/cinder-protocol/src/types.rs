//! RESP reply types.
//!
//! [`Reply`] covers both directions of the wire: client requests arrive as
//! `MultiBulk` arrays of `Bulk` strings, and every server response is one of
//! the variants below. Bulk payloads use `Bytes` so frames can be moved
//! through the pipeline without copying.

use bytes::Bytes;

/// A parsed command line: the verbatim argv of one client request.
pub type CmdLine = Vec<Bytes>;

/// A single RESP value.
///
/// The fixed-content variants (`Ok`, `Pong`, `Queued`, `Unknown`) exist so
/// the hot replies serialize from static bytes without formatting. `NoReply`
/// writes nothing at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Simple string, e.g. `+master\r\n`.
    Status(String),

    /// Error line, e.g. `-ERR unknown command\r\n`.
    Err(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Int(i64),

    /// Binary-safe bulk string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Array of nested replies, e.g. `*2\r\n:1\r\n:2\r\n`.
    MultiBulk(Vec<Reply>),

    /// Null bulk string, `$-1\r\n`. The "no such value" reply.
    NullBulk,

    /// Null array, `*-1\r\n`.
    NullMultiBulk,

    /// Empty array, `*0\r\n`.
    EmptyMultiBulk,

    /// `+OK\r\n`
    Ok,

    /// `+PONG\r\n`
    Pong,

    /// `+QUEUED\r\n`, sent for commands buffered inside MULTI.
    Queued,

    /// Suppressed reply: serializes to zero bytes.
    NoReply,

    /// `-ERR unknown\r\n`, the catch-all for handler faults.
    Unknown,
}

impl Reply {
    /// Builds an error reply from any displayable message.
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Err(msg.into())
    }

    /// Builds the standard arity error for a command.
    pub fn arity_error(cmd: &str) -> Self {
        Reply::Err(format!(
            "ERR wrong number of arguments for '{}' command",
            cmd.to_ascii_lowercase()
        ))
    }

    /// Builds a bulk reply from owned or static bytes.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Builds a multi-bulk reply whose elements are all bulk strings.
    pub fn bulk_array<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let items: Vec<Reply> = items.into_iter().map(|b| Reply::Bulk(b.into())).collect();
        if items.is_empty() {
            Reply::EmptyMultiBulk
        } else {
            Reply::MultiBulk(items)
        }
    }

    /// Returns `true` for error variants (`Err` and `Unknown`).
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Err(_) | Reply::Unknown)
    }

    /// Interprets this reply as a command line if it is an array of bulk
    /// strings (the only shape a client request may take).
    pub fn into_cmd_line(self) -> Option<CmdLine> {
        match self {
            Reply::MultiBulk(items) => {
                let mut line = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Reply::Bulk(b) => line.push(b),
                        _ => return None,
                    }
                }
                Some(line)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_line_from_bulk_array() {
        let reply = Reply::MultiBulk(vec![
            Reply::Bulk(Bytes::from_static(b"GET")),
            Reply::Bulk(Bytes::from_static(b"k")),
        ]);
        let line = reply.into_cmd_line().unwrap();
        assert_eq!(line.len(), 2);
        assert_eq!(&line[0][..], b"GET");
    }

    #[test]
    fn cmd_line_rejects_nested() {
        let reply = Reply::MultiBulk(vec![Reply::Int(1)]);
        assert!(reply.into_cmd_line().is_none());
        assert!(Reply::Int(1).into_cmd_line().is_none());
    }

    #[test]
    fn error_predicate() {
        assert!(Reply::Err("ERR nope".into()).is_error());
        assert!(Reply::Unknown.is_error());
        assert!(!Reply::Ok.is_error());
        assert!(!Reply::NullBulk.is_error());
    }

    #[test]
    fn bulk_array_empty_collapses() {
        let none: Vec<Bytes> = vec![];
        assert_eq!(Reply::bulk_array(none), Reply::EmptyMultiBulk);
    }
}
