//! Message envelope
//!
//! Wire layout of one message once a channel is connected:
//!
//! ```text
//! [opcode:u16][rpc_flags:u32][payload..]
//! ```
//!
//! Bit 31 of `rpc_flags` marks a compressed payload; bits 0..31 carry the
//! rpc id. Rpc id 0 is fire-and-forget, any other value expects a response
//! correlated by the same id.
//!
//! Dispatch-bound traffic wraps the envelope in an [`ActorFrame`] that puts
//! the packed target [`ActorId`] first:
//!
//! ```text
//! [instance_id:u64][address:u32][envelope..]
//! ```

use crate::error::{CodecError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use types::{ActorId, Opcode};

const ENVELOPE_HEADER: usize = 6;
const ACTOR_HEADER: usize = 12;

const COMPRESSED_FLAG: u32 = 1 << 31;
const RPC_ID_MASK: u32 = COMPRESSED_FLAG - 1;

/// One decoded message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub opcode: Opcode,
    pub rpc_id: u32,
    pub compressed: bool,
    pub payload: Bytes,
}

impl MessageEnvelope {
    /// Build an envelope, validating the rpc id range.
    pub fn new(opcode: Opcode, rpc_id: u32, payload: Bytes) -> Result<Self> {
        if rpc_id > RPC_ID_MASK {
            return Err(CodecError::RpcIdOverflow(rpc_id));
        }
        Ok(Self {
            opcode,
            rpc_id,
            compressed: false,
            payload,
        })
    }

    /// Fire-and-forget envelope (rpc id 0).
    pub fn notify(opcode: Opcode, payload: Bytes) -> Self {
        Self {
            opcode,
            rpc_id: 0,
            compressed: false,
            payload,
        }
    }

    /// True when the sender expects a correlated response.
    pub fn is_request(&self) -> bool {
        self.rpc_id != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER + self.payload.len());
        buf.put_u16_le(self.opcode);
        let mut flags = self.rpc_id & RPC_ID_MASK;
        if self.compressed {
            flags |= COMPRESSED_FLAG;
        }
        buf.put_u32_le(flags);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < ENVELOPE_HEADER {
            return Err(CodecError::Truncated {
                needed: ENVELOPE_HEADER,
                got: raw.len(),
            });
        }
        let opcode = LittleEndian::read_u16(&raw[0..2]);
        let flags = LittleEndian::read_u32(&raw[2..6]);
        Ok(Self {
            opcode,
            rpc_id: flags & RPC_ID_MASK,
            compressed: flags & COMPRESSED_FLAG != 0,
            payload: Bytes::copy_from_slice(&raw[ENVELOPE_HEADER..]),
        })
    }
}

/// Actor-addressed frame: target id followed by the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorFrame {
    pub target: ActorId,
    pub envelope: MessageEnvelope,
}

impl ActorFrame {
    pub fn new(target: ActorId, envelope: MessageEnvelope) -> Self {
        Self { target, envelope }
    }

    pub fn encode(&self) -> Bytes {
        let body = self.envelope.encode();
        let mut buf = BytesMut::with_capacity(ACTOR_HEADER + body.len());
        let (instance, address) = self.target.pack();
        buf.put_u64_le(instance);
        buf.put_u32_le(address);
        buf.put_slice(&body);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < ACTOR_HEADER {
            return Err(CodecError::Truncated {
                needed: ACTOR_HEADER,
                got: raw.len(),
            });
        }
        let instance = LittleEndian::read_u64(&raw[0..8]);
        let address = LittleEndian::read_u32(&raw[8..12]);
        Ok(Self {
            target: ActorId::unpack(instance, address),
            envelope: MessageEnvelope::decode(&raw[ACTOR_HEADER..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::Address;

    #[test]
    fn envelope_round_trip() {
        let env = MessageEnvelope::new(10, 1, Bytes::from_static(b"ping")).unwrap();
        let decoded = MessageEnvelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
        assert!(decoded.is_request());
    }

    #[test]
    fn notify_is_not_request() {
        let env = MessageEnvelope::notify(10, Bytes::from_static(b"x"));
        assert!(!env.is_request());
        assert!(!MessageEnvelope::decode(&env.encode()).unwrap().is_request());
    }

    #[test]
    fn compression_flag_survives() {
        let mut env = MessageEnvelope::new(42, 7, Bytes::from_static(b"z")).unwrap();
        env.compressed = true;
        let decoded = MessageEnvelope::decode(&env.encode()).unwrap();
        assert!(decoded.compressed);
        assert_eq!(decoded.rpc_id, 7);
    }

    #[test]
    fn rpc_id_overflow_rejected() {
        let err = MessageEnvelope::new(10, 1 << 31, Bytes::new()).unwrap_err();
        assert_eq!(err, CodecError::RpcIdOverflow(1 << 31));
    }

    #[test]
    fn truncated_envelope_rejected() {
        assert!(matches!(
            MessageEnvelope::decode(&[1, 2, 3]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn actor_frame_round_trip() {
        let target = ActorId::new(Address::new(2, 9), u64::MAX);
        let frame = ActorFrame::new(
            target,
            MessageEnvelope::new(10, 5, Bytes::from_static(b"payload")).unwrap(),
        );
        let decoded = ActorFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_round_trip() {
        let env = MessageEnvelope::notify(10, Bytes::new());
        let decoded = MessageEnvelope::decode(&env.encode()).unwrap();
        assert!(decoded.payload.is_empty());
    }
}
