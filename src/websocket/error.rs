//! WebSocket protocol error types
//!
//! Every error here closes the offending connection; none are retried.

use thiserror::Error;

/// Errors raised while parsing a handshake or a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ends before the frame it declares
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    TruncatedFrame { needed: usize, available: usize },

    /// FIN clear or continuation opcode
    #[error("Fragmented frames are not supported")]
    FragmentedFrame,

    /// Control frames other than close (ping/pong)
    #[error("Unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    /// Reserved opcode value
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// RSV1-3 set without a negotiated extension
    #[error("Reserved bits set in frame header")]
    ReservedBits,

    /// 64-bit length with the most significant bit set
    #[error("Invalid payload length")]
    InvalidLength,

    /// Declared payload exceeds the configured buffer size
    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Client-to-server frame without a mask key
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// Request line or headers could not be parsed
    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    /// No Sec-WebSocket-Key header
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Sec-WebSocket-Key is not base64 of 16 bytes
    #[error("Invalid Sec-WebSocket-Key: {0}")]
    InvalidKey(String),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
