//! cinder-protocol: RESP wire protocol implementation.
//!
//! Provides an incremental parser over buffered bytes and
//! direct-to-buffer serialization of typed replies.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use cinder_protocol::{parse_reply, Reply};
//!
//! let input = b"+OK\r\n";
//! let (reply, consumed) = parse_reply(input).unwrap().unwrap();
//! assert_eq!(reply, Reply::Ok);
//! assert_eq!(consumed, 5);
//!
//! let mut buf = BytesMut::new();
//! Reply::Int(42).serialize(&mut buf);
//! assert_eq!(&buf[..], b":42\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::{parse_reply, resync_offset};
pub use serialize::serialize_cmd_line;
pub use types::{CmdLine, Reply};
