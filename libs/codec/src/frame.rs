//! Frame extraction
//!
//! Messages ride the ARQ byte stream with a 4-byte little-endian length
//! prefix. [`FrameBuffer`] accumulates stream chunks and yields complete
//! frames; a prefix above the configured maximum is a fatal decode error
//! for the carrying channel.

use crate::error::{CodecError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const LEN_PREFIX: usize = 4;

/// Default cap on one logical frame.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Prefix a frame for transmission.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Prefix several buffers as one logical frame.
pub fn encode_frame_parts(parts: &[Bytes]) -> Bytes {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + total);
    buf.put_u32_le(total as u32);
    for part in parts {
        buf.put_slice(part);
    }
    buf.freeze()
}

/// Reassembly buffer on the receive side of one channel.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame: usize,
}

impl FrameBuffer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    /// Append newly-acked stream bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract the next complete frame, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = LittleEndian::read_u32(&self.buf[0..LEN_PREFIX]) as usize;
        if len > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}
