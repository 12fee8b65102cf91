//! Protocol error types for the spire wire format.

use thiserror::Error;

/// Errors that can occur when encoding or decoding wire messages.
///
/// Any of these leaves the connection's byte stream in an unknown
/// position, so callers must discard the connection rather than pool it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete header or body yet.
    #[error("incomplete message: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// The proto header carried a version this client doesn't speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The proto header carried an unknown message type.
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    /// A declared size exceeds what the header can express or what we
    /// are willing to allocate.
    #[error("message size {size} exceeds limit {limit}")]
    SizeTooLarge { size: u64, limit: u64 },

    /// The message header declared a header size other than 22.
    #[error("invalid message header size: {0}")]
    InvalidHeaderSize(u8),

    /// A field or op declared a length that runs past the body.
    #[error("truncated {what} at offset {offset}")]
    Truncated { what: &'static str, offset: usize },

    /// Compressed payload failed to deflate, inflate, or inflated to the
    /// wrong size.
    #[error("compression error: {0}")]
    Compression(String),

    /// An info response line didn't follow the `name\tvalue` form.
    #[error("malformed info response: {0}")]
    MalformedInfo(String),

    /// A batch response named a row that wasn't requested, or carried a
    /// digest other than the requested row's.
    #[error("unexpected batch row {0}")]
    UnexpectedBatchRow(u32),

    /// A value carried a particle type that can't be decoded.
    #[error("invalid particle: {0}")]
    InvalidParticle(String),
}

impl ProtocolError {
    /// Shorthand for an `Incomplete` error.
    pub fn incomplete(needed: usize, available: usize) -> Self {
        ProtocolError::Incomplete { needed, available }
    }

    /// Returns true when more bytes would let parsing succeed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Incomplete { .. })
    }
}
