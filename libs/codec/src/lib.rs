//! # Weft Protocol Codec
//!
//! The "rules" layer of the Weft transport: everything that defines what
//! bytes mean, with no sockets and no threads.
//!
//! - [`envelope`]: the message envelope carried once a channel is connected —
//!   `[opcode:u16][rpc_flags:u32][payload]` — and the actor-addressed frame
//!   that wraps it for dispatch-bound traffic.
//! - [`handshake`]: the fixed-size control datagrams (`OPEN`, `OPEN_ACK`,
//!   `RESET`) that open and tear down channels. Any other leading tag is an
//!   ordinary data datagram addressed by channel id.
//! - [`arq`]: the positive-ack, retransmit-on-gap reliability codec that
//!   turns unreliable datagrams into an ordered, deduplicated byte stream.
//! - [`frame`]: length-prefixed frame extraction over the reassembled
//!   stream.
//!
//! All multi-byte header fields are little-endian.

pub mod arq;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;

pub use arq::{ArqCodec, ArqConfig};
pub use envelope::{ActorFrame, MessageEnvelope};
pub use error::{CodecError, Result};
pub use frame::{encode_frame, encode_frame_parts, FrameBuffer, DEFAULT_MAX_FRAME};
pub use handshake::{ControlDatagram, MIN_CHANNEL_ID, TAG_OPEN, TAG_OPEN_ACK, TAG_RESET};
