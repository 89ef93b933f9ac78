//! Protocol error types for RESP parsing.

use thiserror::Error;

/// Errors that can occur when decoding the RESP wire format.
///
/// Everything except [`ProtocolError::Incomplete`] is a real protocol fault.
/// Faults are recoverable at the connection level: the driver reports the
/// error to the client and resynchronizes at the next line boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The first byte of a frame didn't match any known RESP type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer from a length or `:` line.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared a nonsensical length.
    #[error("invalid frame length: {0}")]
    InvalidLength(i64),

    /// A bulk string declared a length above the 512 MiB cap.
    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(i64),

    /// An array declared more elements than the sanity cap allows.
    #[error("too many array elements: {0}")]
    TooManyElements(usize),

    /// Arrays nested deeper than the sanity cap.
    #[error("frames nested deeper than {0} levels")]
    NestingTooDeep(usize),

    /// A bulk string body was not terminated by CRLF.
    #[error("bulk string missing CRLF terminator")]
    MissingCrlf,

    /// A simple string or error line contained invalid UTF-8.
    #[error("invalid utf-8 in {0} line")]
    InvalidUtf8(&'static str),
}

impl ProtocolError {
    /// Returns `true` if this is a real fault rather than a short read.
    pub fn is_fault(&self) -> bool {
        !matches!(self, ProtocolError::Incomplete)
    }
}
