//! Wire codec error types

use thiserror::Error;

/// Errors produced while encoding or decoding tapmesh wire formats
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Bencode encoding/decoding failed
    #[error("bencode error: {0}")]
    Bencode(String),

    /// Datagram shorter than the fixed frame header
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Header advertises more payload than the datagram carries
    #[error("frame truncated: header says {expected} payload bytes, got {actual}")]
    FrameTruncated { expected: usize, actual: usize },

    /// Payload does not fit the u16 length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Frame type value outside the known set
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u16),
}

/// Result type for codec operations
pub type ProtoResult<T> = Result<T, ProtoError>;
