//! Dispatch error types

use thiserror::Error;
use types::{ActorId, Opcode};

/// Main dispatch error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No fiber or entity exists for the target address.
    #[error("actor {0} not found")]
    ActorNotFound(ActorId),

    /// The entity exists but is not actor-addressable.
    #[error("actor {0} has no mailbox")]
    MailboxMissing(ActorId),

    /// The instance already has a mailbox on this fiber.
    #[error("actor {0} already has a mailbox")]
    DuplicateMailbox(ActorId),

    /// No handler registered for the opcode.
    #[error("no handler registered for opcode {0}")]
    HandlerMissing(Opcode),

    /// Handler reported a failure; carried back as a negative
    /// acknowledgement for requests.
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
