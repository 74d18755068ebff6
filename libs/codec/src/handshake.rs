//! Channel handshake datagrams
//!
//! Fixed-size control datagrams, distinguished from data by the first four
//! bytes (little-endian tag):
//!
//! ```text
//! OPEN      [tag=1:u32][local_id:u32]                 8 bytes
//! OPEN_ACK  [tag=2:u32][local_id:u32][remote_id:u32]  12 bytes
//! RESET     [tag=3:u32][remote_id:u32]                8 bytes
//! ```
//!
//! Any other leading u32 is a data datagram addressed by channel id, so the
//! transport must never allocate channel ids in `1..=3`.

use crate::error::{CodecError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

pub const TAG_OPEN: u32 = 1;
pub const TAG_OPEN_ACK: u32 = 2;
pub const TAG_RESET: u32 = 3;

/// Channel ids below this value would collide with control tags.
pub const MIN_CHANNEL_ID: u32 = 1000;

const OPEN_LEN: usize = 8;
const OPEN_ACK_LEN: usize = 12;
const RESET_LEN: usize = 8;

/// A parsed control datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDatagram {
    /// Client probe: `local_id` is the sender's channel id.
    Open { local_id: u32 },
    /// Server accept: `local_id` is the acceptor's id, `remote_id` echoes
    /// the opener's.
    OpenAck { local_id: u32, remote_id: u32 },
    /// Immediate disposal of the peer channel identified by `remote_id`.
    Reset { remote_id: u32 },
}

impl ControlDatagram {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPEN_ACK_LEN);
        match *self {
            Self::Open { local_id } => {
                buf.put_u32_le(TAG_OPEN);
                buf.put_u32_le(local_id);
            }
            Self::OpenAck {
                local_id,
                remote_id,
            } => {
                buf.put_u32_le(TAG_OPEN_ACK);
                buf.put_u32_le(local_id);
                buf.put_u32_le(remote_id);
            }
            Self::Reset { remote_id } => {
                buf.put_u32_le(TAG_RESET);
                buf.put_u32_le(remote_id);
            }
        }
        buf.freeze()
    }

    /// Classify a received datagram. `Ok(None)` means data: the leading u32
    /// is a channel id, not a control tag.
    pub fn parse(raw: &[u8]) -> Result<Option<Self>> {
        if raw.len() < 4 {
            return Err(CodecError::Truncated {
                needed: 4,
                got: raw.len(),
            });
        }
        let tag = LittleEndian::read_u32(&raw[0..4]);
        match tag {
            TAG_OPEN => {
                if raw.len() != OPEN_LEN {
                    return Err(CodecError::MalformedControl {
                        tag,
                        len: raw.len(),
                    });
                }
                Ok(Some(Self::Open {
                    local_id: LittleEndian::read_u32(&raw[4..8]),
                }))
            }
            TAG_OPEN_ACK => {
                if raw.len() != OPEN_ACK_LEN {
                    return Err(CodecError::MalformedControl {
                        tag,
                        len: raw.len(),
                    });
                }
                Ok(Some(Self::OpenAck {
                    local_id: LittleEndian::read_u32(&raw[4..8]),
                    remote_id: LittleEndian::read_u32(&raw[8..12]),
                }))
            }
            TAG_RESET => {
                if raw.len() != RESET_LEN {
                    return Err(CodecError::MalformedControl {
                        tag,
                        len: raw.len(),
                    });
                }
                Ok(Some(Self::Reset {
                    remote_id: LittleEndian::read_u32(&raw[4..8]),
                }))
            }
            _ => Ok(None),
        }
    }
}
