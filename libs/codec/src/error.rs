//! Codec error types
//!
//! A decode failure on a connected channel is treated as fatal for that
//! channel by the transport layer; nothing here is recoverable in place.

use thiserror::Error;

/// Main codec error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before a complete header or payload.
    #[error("truncated input: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// A control tag with a length that does not match its fixed layout.
    #[error("malformed control datagram: tag {tag}, length {len}")]
    MalformedControl { tag: u32, len: usize },

    /// Frame length prefix exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Rpc id does not fit in the 31 bits the flags word reserves for it.
    #[error("rpc id {0} exceeds 31-bit range")]
    RpcIdOverflow(u32),

    /// ARQ segment with an unknown kind byte.
    #[error("unknown ARQ segment kind {0}")]
    UnknownSegment(u8),
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
