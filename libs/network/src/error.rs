//! Transport error types

use codec::CodecError;
use thiserror::Error;

/// Main transport error type.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire decode failure; fatal for the carrying channel.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No channel is mapped to this id.
    #[error("channel {0} not found")]
    ChannelNotFound(u32),

    /// The channel was reset, idled out, or disposed.
    #[error("channel {0} disconnected")]
    ChannelDisconnected(u32),

    /// Both halves of the id space are in use.
    #[error("channel ids exhausted")]
    IdsExhausted,

    /// Invalid service configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl TransportError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
