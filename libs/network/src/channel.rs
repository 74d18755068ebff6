//! Channel state and handles
//!
//! One [`Channel`] per reliable stream. All mutable state sits behind a
//! single mutex per channel, so two channels never contend and the service
//! map stays lock-cheap.

use crate::error::{Result, TransportError};
use crate::service::ChannelService;
use bytes::Bytes;
use codec::{ArqCodec, FrameBuffer};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Client: OPEN sent, OPEN_ACK not yet seen.
    Handshaking,
    Connected,
    Disconnected,
}

/// Why a channel was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer sent RESET.
    Reset,
    /// No traffic within the idle bound.
    Idle,
    /// Handshake never completed within the connect timeout.
    ConnectTimeout,
    /// A segment exhausted its retransmission budget.
    DeadLink,
    /// Undecodable inbound data.
    Codec,
    /// Local [`ChannelHandle::dispose`] or service shutdown.
    Local,
}

pub(crate) struct ChannelInner {
    pub state: ChannelState,
    /// Peer's channel id; 0 until the handshake reveals it.
    pub remote_id: u32,
    pub arq: ArqCodec,
    pub frames: FrameBuffer,
    /// Frames queued while still Handshaking.
    pub pending: Vec<Bytes>,
    /// Feeds the handle's `recv`; dropped on disposal to fault it.
    pub inbound: Option<mpsc::UnboundedSender<Bytes>>,
    pub created_ms: u64,
    pub last_recv_ms: u64,
    pub last_probe_ms: u64,
}

pub(crate) struct Channel {
    pub local_id: u32,
    pub peer: SocketAddr,
    /// True for server channels created by an inbound OPEN.
    pub accepted: bool,
    pub inner: Mutex<ChannelInner>,
}

/// Caller-facing end of one channel.
///
/// Sends go through the owning service; `recv` yields complete frames in
/// order and fails with [`TransportError::ChannelDisconnected`] once the
/// channel is disposed for any reason.
pub struct ChannelHandle {
    id: u32,
    peer: SocketAddr,
    service: Arc<ChannelService>,
    frames: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelHandle {
    pub(crate) fn new(
        id: u32,
        peer: SocketAddr,
        service: Arc<ChannelService>,
        frames: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            id,
            peer,
            service,
            frames,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue one frame for reliable in-order delivery.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.service.send(self.id, payload)
    }

    /// Queue several buffers as one logical frame, without concatenating
    /// them first.
    pub fn send_frames(&self, parts: &[Bytes]) -> Result<()> {
        self.service.send_parts(self.id, parts)
    }

    /// Next complete inbound frame.
    pub async fn recv(&mut self) -> Result<Bytes> {
        self.frames
            .recv()
            .await
            .ok_or(TransportError::ChannelDisconnected(self.id))
    }

    /// Tear the channel down and RESET the peer. Idempotent.
    pub fn dispose(&self) {
        self.service.disconnect(self.id);
    }
}
