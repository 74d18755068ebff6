//! ARQ reliability codec
//!
//! Positive-ack sliding-window retransmission over unreliable datagrams.
//! The codec owns no socket and no clock: callers feed received segment
//! bytes in through [`ArqCodec::input`], pull in-order stream chunks out
//! through [`ArqCodec::recv`], and drive timers by calling
//! [`ArqCodec::update`] with a monotonic millisecond timestamp. `update`
//! emits the datagrams to put on the wire.
//!
//! Segment layouts (little-endian):
//!
//! ```text
//! PUSH  [kind=1:u8][seq:u32][len:u16][payload..]
//! ACK   [kind=2:u8][una:u32]            cumulative: acks everything < una
//! ```
//!
//! One segment per datagram. Sequence numbers wrap; all comparisons are
//! serial-number arithmetic. The receive side buffers out-of-order segments
//! within the window, deduplicates, and re-acks duplicates so a lost ACK
//! cannot stall the sender. The send side retransmits on RTO expiry and
//! fast-retransmits the oldest unacked segment after repeated duplicate
//! acks.

use crate::error::{CodecError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

const SEG_PUSH: u8 = 1;
const SEG_ACK: u8 = 2;

const PUSH_HEADER: usize = 7;
const ACK_LEN: usize = 5;

/// Tuning knobs for one ARQ stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArqConfig {
    /// Maximum unacked segments in flight.
    pub window: usize,
    /// Retransmission timeout in milliseconds.
    pub rto_ms: u64,
    /// Stream chunk size; larger sends are split.
    pub max_payload: usize,
    /// Duplicate acks before fast retransmit.
    pub fast_retransmit_dups: u32,
    /// Transmissions of one segment before the link is declared dead.
    pub dead_link: u32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            window: 64,
            rto_ms: 100,
            max_payload: 1024,
            fast_retransmit_dups: 3,
            dead_link: 20,
        }
    }
}

/// True when `a` is serially before `b`.
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

struct SendSlot {
    seq: u32,
    data: Bytes,
    /// None forces transmission on the next update.
    last_sent: Option<u64>,
    xmits: u32,
}

/// One direction-pair of the reliability protocol.
pub struct ArqCodec {
    cfg: ArqConfig,
    // Send side.
    snd_next: u32,
    snd_queue: VecDeque<Bytes>,
    snd_buf: VecDeque<SendSlot>,
    last_ack_una: u32,
    dup_acks: u32,
    dead: bool,
    // Receive side.
    rcv_next: u32,
    rcv_buf: HashMap<u32, Bytes>,
    rcv_ready: VecDeque<Bytes>,
    ack_pending: bool,
}

impl ArqCodec {
    pub fn new(cfg: ArqConfig) -> Self {
        // The PUSH header carries the chunk length as u16; clamp so a
        // larger configured payload cannot emit a wrapped length field.
        let cfg = ArqConfig {
            max_payload: cfg.max_payload.clamp(1, u16::MAX as usize),
            ..cfg
        };
        Self {
            cfg,
            snd_next: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            last_ack_una: 0,
            dup_acks: 0,
            dead: false,
            rcv_next: 0,
            rcv_buf: HashMap::new(),
            rcv_ready: VecDeque::new(),
            ack_pending: false,
        }
    }

    /// Queue stream bytes for transmission, split into window chunks.
    pub fn send(&mut self, data: &[u8]) {
        for chunk in data.chunks(self.cfg.max_payload) {
            self.snd_queue.push_back(Bytes::copy_from_slice(chunk));
        }
    }

    /// Feed one received segment (datagram body after the channel id).
    pub fn input(&mut self, raw: &[u8]) -> Result<()> {
        if raw.is_empty() {
            return Err(CodecError::Truncated { needed: 1, got: 0 });
        }
        match raw[0] {
            SEG_PUSH => self.input_push(raw),
            SEG_ACK => self.input_ack(raw),
            kind => Err(CodecError::UnknownSegment(kind)),
        }
    }

    fn input_push(&mut self, raw: &[u8]) -> Result<()> {
        if raw.len() < PUSH_HEADER {
            return Err(CodecError::Truncated {
                needed: PUSH_HEADER,
                got: raw.len(),
            });
        }
        let seq = LittleEndian::read_u32(&raw[1..5]);
        let len = LittleEndian::read_u16(&raw[5..7]) as usize;
        if raw.len() != PUSH_HEADER + len {
            return Err(CodecError::Truncated {
                needed: PUSH_HEADER + len,
                got: raw.len(),
            });
        }

        if seq_before(seq, self.rcv_next) {
            // Duplicate of something already delivered; the ack was lost.
            self.ack_pending = true;
            return Ok(());
        }
        if seq.wrapping_sub(self.rcv_next) as usize >= self.cfg.window {
            trace!(seq, rcv_next = self.rcv_next, "segment beyond window, dropped");
            return Ok(());
        }

        self.rcv_buf
            .entry(seq)
            .or_insert_with(|| Bytes::copy_from_slice(&raw[PUSH_HEADER..]));
        while let Some(data) = self.rcv_buf.remove(&self.rcv_next) {
            self.rcv_ready.push_back(data);
            self.rcv_next = self.rcv_next.wrapping_add(1);
        }
        self.ack_pending = true;
        Ok(())
    }

    fn input_ack(&mut self, raw: &[u8]) -> Result<()> {
        if raw.len() != ACK_LEN {
            return Err(CodecError::Truncated {
                needed: ACK_LEN,
                got: raw.len(),
            });
        }
        let una = LittleEndian::read_u32(&raw[1..5]);

        while let Some(front) = self.snd_buf.front() {
            if seq_before(front.seq, una) {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }

        if una == self.last_ack_una {
            if let Some(front) = self.snd_buf.front_mut() {
                self.dup_acks += 1;
                if self.dup_acks >= self.cfg.fast_retransmit_dups {
                    trace!(seq = front.seq, "fast retransmit");
                    front.last_sent = None;
                    self.dup_acks = 0;
                }
            }
        } else {
            self.last_ack_una = una;
            self.dup_acks = 0;
        }
        Ok(())
    }

    /// Pop the next in-order stream chunk, if any.
    pub fn recv(&mut self) -> Option<Bytes> {
        self.rcv_ready.pop_front()
    }

    /// Drive timers: fill the send window, (re)transmit due segments, and
    /// flush a pending cumulative ack. Emitted datagrams land in `out`.
    pub fn update(&mut self, now_ms: u64, out: &mut Vec<Bytes>) {
        while self.snd_buf.len() < self.cfg.window {
            let Some(data) = self.snd_queue.pop_front() else {
                break;
            };
            let seq = self.snd_next;
            self.snd_next = self.snd_next.wrapping_add(1);
            self.snd_buf.push_back(SendSlot {
                seq,
                data,
                last_sent: None,
                xmits: 0,
            });
        }

        for slot in self.snd_buf.iter_mut() {
            let due = match slot.last_sent {
                None => true,
                Some(at) => now_ms.saturating_sub(at) >= self.cfg.rto_ms,
            };
            if !due {
                continue;
            }
            let mut buf = BytesMut::with_capacity(PUSH_HEADER + slot.data.len());
            buf.put_u8(SEG_PUSH);
            buf.put_u32_le(slot.seq);
            buf.put_u16_le(slot.data.len() as u16);
            buf.put_slice(&slot.data);
            out.push(buf.freeze());
            slot.last_sent = Some(now_ms);
            slot.xmits += 1;
            if slot.xmits >= self.cfg.dead_link {
                self.dead = true;
            }
        }

        if self.ack_pending {
            let mut buf = BytesMut::with_capacity(ACK_LEN);
            buf.put_u8(SEG_ACK);
            buf.put_u32_le(self.rcv_next);
            out.push(buf.freeze());
            self.ack_pending = false;
        }
    }

    /// True when unacked or unqueued data remains on the send side.
    pub fn has_pending(&self) -> bool {
        !self.snd_buf.is_empty() || !self.snd_queue.is_empty()
    }

    /// True after some segment exhausted its retransmission budget.
    pub fn is_dead(&self) -> bool {
        self.dead
    }
}
