//! Opcodes and dispatch error codes
//!
//! An [`Opcode`] selects the registered handler for a message. Values below
//! [`OPCODE_USER_MIN`] are reserved for the runtime itself.

/// Message opcode carried in the envelope header.
pub type Opcode = u16;

/// Reserved: never valid on the wire.
pub const OPCODE_INVALID: Opcode = 0;

/// Reserved: synthesized negative-acknowledgement reply. Payload is a
/// little-endian [`ErrorCode`].
pub const OPCODE_ERROR_RESPONSE: Opcode = 1;

/// First opcode available to user-registered handlers.
pub const OPCODE_USER_MIN: Opcode = 10;

/// Error codes carried in negative-acknowledgement payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// No entity exists for the target address.
    ActorNotFound = 1,
    /// The entity exists but is not actor-addressable.
    MailboxMissing = 2,
    /// The carrying channel was reset or idled out.
    ChannelDisconnected = 3,
    /// A coroutine lock was force-advanced on timeout.
    LockTimeout = 4,
    /// The payload could not be decoded.
    Serialization = 5,
    /// No handler is registered for the opcode.
    HandlerMissing = 6,
    /// The handler ran and returned an error.
    HandlerFailed = 7,
}

impl ErrorCode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::ActorNotFound),
            2 => Some(Self::MailboxMissing),
            3 => Some(Self::ChannelDisconnected),
            4 => Some(Self::LockTimeout),
            5 => Some(Self::Serialization),
            6 => Some(Self::HandlerMissing),
            7 => Some(Self::HandlerFailed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in [
            ErrorCode::ActorNotFound,
            ErrorCode::MailboxMissing,
            ErrorCode::ChannelDisconnected,
            ErrorCode::LockTimeout,
            ErrorCode::Serialization,
            ErrorCode::HandlerMissing,
            ErrorCode::HandlerFailed,
        ] {
            assert_eq!(ErrorCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(ErrorCode::from_u32(0), None);
        assert_eq!(ErrorCode::from_u32(99), None);
    }

    #[test]
    fn reserved_opcodes_below_user_range() {
        assert!(OPCODE_INVALID < OPCODE_USER_MIN);
        assert!(OPCODE_ERROR_RESPONSE < OPCODE_USER_MIN);
    }
}
