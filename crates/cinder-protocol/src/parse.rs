//! Incremental RESP parser.
//!
//! Operates on buffered byte slices; the caller reads from the network into
//! a buffer and retries once more data arrives. A `Cursor<&[u8]>` tracks the
//! position without consuming, so an incomplete frame costs nothing.
//!
//! Frame boundaries are determined entirely by declared lengths, never by
//! buffer fill: a bulk string of 10 bytes is complete exactly when 10 bytes
//! plus the trailing CRLF are present. Malformed input (bad length prefix,
//! non-numeric integer, missing CRLF) is a recoverable fault: the caller
//! reports it and uses [`resync_offset`] to skip to the next line boundary.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Reply;

/// Maximum length of a bulk string in bytes (512 MiB).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Maximum number of elements in an array. Caps memory amplification from
/// tiny elements with a huge declared count.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum nesting depth for arrays. Client requests are flat; anything
/// deeper than this is hostile input.
const MAX_NESTING_DEPTH: usize = 32;

/// Cap for `Vec::with_capacity` when parsing arrays, so a declared count
/// cannot force a huge up-front allocation.
const PREALLOC_CAP: usize = 1024;

/// Parses one RESP value from the front of `buf`.
///
/// Returns `Ok(Some((reply, consumed)))` when a complete frame was parsed,
/// `Ok(None)` when the buffer doesn't hold a full frame yet, or an error for
/// malformed data.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, 0) {
        Ok(reply) => {
            let consumed = cursor.position() as usize;
            Ok(Some((reply, consumed)))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// After a parse fault, returns how many bytes to discard so parsing resumes
/// at the byte following the next CRLF. `None` means the boundary hasn't
/// arrived yet; discard the whole buffer as it fills.
pub fn resync_offset(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            return Some(cr + 2);
        }
        pos = cr + 1;
    }
    None
}

fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Reply, ProtocolError> {
    let prefix = read_byte(cursor)?;

    match prefix {
        b'+' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::InvalidUtf8("simple string"))?;
            Ok(match s {
                "OK" => Reply::Ok,
                "PONG" => Reply::Pong,
                "QUEUED" => Reply::Queued,
                _ => Reply::Status(s.to_owned()),
            })
        }
        b'-' => {
            let line = read_line(cursor)?;
            let s =
                std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8("error"))?;
            Ok(Reply::Err(s.to_owned()))
        }
        b':' => {
            let val = read_integer_line(cursor)?;
            Ok(Reply::Int(val))
        }
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                return Ok(Reply::NullBulk);
            }
            if len < 0 {
                return Err(ProtocolError::InvalidLength(len));
            }
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkTooLarge(len));
            }
            let len = len as usize;

            if remaining(cursor) < len + 2 {
                return Err(ProtocolError::Incomplete);
            }

            let pos = cursor.position() as usize;
            {
                let buf = cursor.get_ref();
                if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
                    return Err(ProtocolError::MissingCrlf);
                }
            }
            cursor.set_position((pos + len + 2) as u64);

            let data = Bytes::copy_from_slice(&cursor.get_ref()[pos..pos + len]);
            Ok(Reply::Bulk(data))
        }
        b'*' => {
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
            }

            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Reply::NullMultiBulk);
            }
            if count < 0 {
                return Err(ProtocolError::InvalidLength(count));
            }
            if count == 0 {
                return Ok(Reply::EmptyMultiBulk);
            }
            if count as usize > MAX_ARRAY_ELEMENTS {
                return Err(ProtocolError::TooManyElements(count as usize));
            }

            let count = count as usize;
            let mut items = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                items.push(try_parse(cursor, next_depth)?);
            }
            Ok(Reply::MultiBulk(items))
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    if pos >= cursor.get_ref().len() {
        return Err(ProtocolError::Incomplete);
    }
    cursor.set_position((pos + 1) as u64);
    Ok(cursor.get_ref()[pos])
}

/// Returns the bytes up to (not including) the next CRLF and advances past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let buf = *cursor.get_ref();
    let start = cursor.position() as usize;

    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(&buf[start..cr]);
        }
        // bare \r without \n, keep scanning
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = read_line(cursor)?;
    parse_i64_bytes(line)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    let len = cursor.get_ref().len();
    let pos = cursor.position() as usize;
    len.saturating_sub(pos)
}

/// Parses an i64 from ASCII without allocating.
///
/// Negative numbers accumulate in the negative direction so `i64::MIN`
/// is representable without overflow.
fn parse_i64_bytes(buf: &[u8]) -> Result<i64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let (negative, digits) = if buf[0] == b'-' {
        (true, &buf[1..])
    } else {
        (false, buf)
    };

    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let digit = (b - b'0') as i64;
        n = if negative {
            n.checked_mul(10).and_then(|n| n.checked_sub(digit))
        } else {
            n.checked_mul(10).and_then(|n| n.checked_add(digit))
        }
        .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}
