//! # Weft Shared Types
//!
//! Leaf crate holding the identifiers every other Weft crate agrees on:
//!
//! - [`Address`]: locates one fiber across the whole deployment
//!   (`process_id`, `fiber_id`).
//! - [`ActorId`]: locates one addressable actor inside a fiber
//!   (`Address` + `instance_id`).
//! - [`Opcode`] constants and dispatch-level error codes carried in
//!   negative-acknowledgement replies.
//!
//! Both identifier types pack into fixed-width wire values with lossless
//! round-trip over their full field ranges; see [`address`] for the layout.

pub mod address;
pub mod opcode;

pub use address::{Address, ActorId, FiberId, InstanceId, ProcessId};
pub use opcode::{ErrorCode, Opcode, OPCODE_ERROR_RESPONSE, OPCODE_USER_MIN};
