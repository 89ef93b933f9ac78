//! Startup replay of the append-only log.
//!
//! The file is a concatenation of RESP multi-bulk frames, so recovery is
//! the protocol parser pointed at the file. `SELECT` frames are consumed
//! here and folded into the db index attached to each yielded record; the
//! engine applies everything else through its normal dispatch path.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::{Buf, BytesMut};
use cinder_protocol::{parse_reply, CmdLine, ProtocolError};
use thiserror::Error;

/// Read granularity.
const CHUNK: usize = 64 * 1024;

/// Errors that abort a replay (and with it, startup).
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("aof replay io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("aof replay protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("aof contains a frame that is not a command array")]
    NotACommand,

    #[error("aof contains a truncated trailing frame")]
    TruncatedFrame,

    #[error("aof contains an invalid SELECT: {0}")]
    BadSelect(String),
}

/// Streaming reader yielding `(db_index, argv)` records.
pub struct AofReplayer {
    file: File,
    buf: BytesMut,
    eof: bool,
    current_db: usize,
}

impl AofReplayer {
    /// Opens the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        Ok(Self {
            file: File::open(path)?,
            buf: BytesMut::with_capacity(CHUNK),
            eof: false,
            current_db: 0,
        })
    }

    /// Returns the next command record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<(usize, CmdLine)>, ReplayError> {
        loop {
            match parse_reply(&self.buf)? {
                Some((reply, consumed)) => {
                    self.buf.advance(consumed);
                    let Some(line) = reply.into_cmd_line() else {
                        return Err(ReplayError::NotACommand);
                    };
                    if line.is_empty() {
                        return Err(ReplayError::NotACommand);
                    }
                    if line[0].eq_ignore_ascii_case(b"SELECT") {
                        self.apply_select(&line)?;
                        continue;
                    }
                    return Ok(Some((self.current_db, line)));
                }
                None => {
                    if self.eof {
                        return if self.buf.is_empty() {
                            Ok(None)
                        } else {
                            // bytes remain but no complete frame: the file
                            // was cut mid-record
                            Err(ReplayError::TruncatedFrame)
                        };
                    }
                    self.fill()?;
                }
            }
        }
    }

    fn apply_select(&mut self, line: &CmdLine) -> Result<(), ReplayError> {
        if line.len() != 2 {
            return Err(ReplayError::BadSelect("wrong arity".into()));
        }
        let index = std::str::from_utf8(&line[1])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| ReplayError::BadSelect(String::from_utf8_lossy(&line[1]).into()))?;
        self.current_db = index;
        Ok(())
    }

    fn fill(&mut self) -> Result<(), ReplayError> {
        let mut chunk = [0u8; CHUNK];
        let n = self.file.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }
}
