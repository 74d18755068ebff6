//! Channel service
//!
//! Demultiplexes one datagram socket into reliable channels. Each received
//! datagram is either a control datagram (OPEN / OPEN_ACK / RESET) driving
//! the handshake state machine, or data addressed by the receiver's channel
//! id and fed to that channel's ARQ codec.
//!
//! Channel ids come from two disjoint counters so the two ends of a
//! handshake can never collide: client ids ascend from
//! [`MIN_CHANNEL_ID`](codec::MIN_CHANNEL_ID) through the bottom half of the
//! id space, server-accepted ids descend from `u32::MAX` through the top
//! half. Each counter wraps within its own half and skips ids still mapped.
//!
//! The service is clock-driven: `update(now_ms)` receives, retransmits, and
//! reclaims. Tests call it directly with a synthetic clock; production code
//! runs [`ChannelService::spawn_driver`] on a dedicated thread.

use crate::channel::{Channel, ChannelHandle, ChannelInner, ChannelState, DisconnectReason};
use crate::error::{Result, TransportError};
use crate::socket::Datagram;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use codec::{
    encode_frame, encode_frame_parts, ArqCodec, ArqConfig, ControlDatagram, FrameBuffer,
    DEFAULT_MAX_FRAME, MIN_CHANNEL_ID,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CLIENT_ID_MAX: u32 = 0x7FFF_FFFF;
const SERVER_ID_MIN: u32 = 0x8000_0000;
const ALLOC_ATTEMPTS: u32 = 65_536;
const RECV_BUF: usize = 2048;

/// Service tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Handshake deadline in milliseconds, both for a client awaiting
    /// OPEN_ACK and for an accepted channel awaiting first data.
    pub connect_timeout_ms: u64,
    /// Connected channel with no inbound traffic for this long is disposed.
    pub idle_timeout_ms: u64,
    /// OPEN probe resend interval while handshaking.
    pub probe_interval_ms: u64,
    /// Largest logical frame accepted from a peer.
    pub max_frame: usize,
    pub arq: ArqConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            idle_timeout_ms: 30_000,
            probe_interval_ms: 300,
            max_frame: DEFAULT_MAX_FRAME,
            arq: ArqConfig::default(),
        }
    }
}

/// Point-in-time service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub accepted: u64,
    /// Channels disposed by idle or handshake timeout.
    pub reclaimed: u64,
    pub resets_sent: u64,
}

#[derive(Default)]
struct StatCells {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    accepted: AtomicU64,
    reclaimed: AtomicU64,
    resets_sent: AtomicU64,
}

impl StatCells {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
        }
    }
}

/// Channel lifecycle notifications delivered to the service owner.
pub enum TransportEvent {
    /// A peer completed the inbound handshake.
    Accepted(ChannelHandle),
    /// A channel was disposed; fires exactly once per channel.
    Disconnected {
        channel: u32,
        reason: DisconnectReason,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted(handle) => f
                .debug_tuple("Accepted")
                .field(&handle.id())
                .field(&handle.peer())
                .finish(),
            Self::Disconnected { channel, reason } => f
                .debug_struct("Disconnected")
                .field("channel", channel)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// One socket's worth of reliable channels.
pub struct ChannelService {
    socket: Arc<dyn Datagram>,
    config: ServiceConfig,
    channels: DashMap<u32, Arc<Channel>>,
    /// `(peer, peer's channel id)` → our id, for idempotent re-accept.
    accept_index: DashMap<(SocketAddr, u32), u32>,
    next_client: AtomicU32,
    next_server: AtomicU32,
    events: mpsc::UnboundedSender<TransportEvent>,
    stats: StatCells,
    epoch: Instant,
    stopped: AtomicBool,
}

impl ChannelService {
    pub fn new(
        socket: Arc<dyn Datagram>,
        config: ServiceConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        if config.arq.max_payload + 16 > RECV_BUF {
            return Err(TransportError::configuration(format!(
                "arq max_payload {} does not fit the receive buffer",
                config.arq.max_payload
            )));
        }
        let (events, events_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            socket,
            config,
            channels: DashMap::new(),
            accept_index: DashMap::new(),
            next_client: AtomicU32::new(0),
            next_server: AtomicU32::new(0),
            events,
            stats: StatCells::default(),
            epoch: Instant::now(),
            stopped: AtomicBool::new(false),
        });
        Ok((service, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Milliseconds since service construction; the clock `spawn_driver`
    /// feeds to `update`.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Open a client channel to `peer`. The handle is usable immediately:
    /// sends queue until the handshake completes.
    pub fn connect(self: &Arc<Self>, peer: SocketAddr) -> Result<ChannelHandle> {
        let id = self.alloc_client_id()?;
        let now = self.now_ms();
        let (inbound, frames) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel {
            local_id: id,
            peer,
            accepted: false,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Handshaking,
                remote_id: 0,
                arq: ArqCodec::new(self.config.arq.clone()),
                frames: FrameBuffer::new(self.config.max_frame),
                pending: Vec::new(),
                inbound: Some(inbound),
                created_ms: now,
                last_recv_ms: now,
                last_probe_ms: now,
            }),
        });
        self.channels.insert(id, channel);
        self.send_control(peer, ControlDatagram::Open { local_id: id });
        info!(channel = id, peer = %peer, "connecting");
        Ok(ChannelHandle::new(id, peer, self.clone(), frames))
    }

    /// Queue one frame on `channel` for reliable in-order delivery.
    pub fn send(&self, channel: u32, payload: &[u8]) -> Result<()> {
        self.send_stream(channel, encode_frame(payload))
    }

    /// Queue several buffers on `channel` as one logical frame.
    pub fn send_parts(&self, channel: u32, parts: &[Bytes]) -> Result<()> {
        self.send_stream(channel, encode_frame_parts(parts))
    }

    fn send_stream(&self, id: u32, frame: Bytes) -> Result<()> {
        let channel = self
            .channels
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::ChannelNotFound(id))?;
        let mut inner = channel.inner.lock();
        match inner.state {
            ChannelState::Disconnected => Err(TransportError::ChannelDisconnected(id)),
            ChannelState::Connected => {
                inner.arq.send(&frame);
                Ok(())
            }
            ChannelState::Handshaking => {
                inner.pending.push(frame);
                Ok(())
            }
        }
    }

    /// Dispose `channel` and RESET the peer. No-op if already gone.
    pub fn disconnect(&self, channel: u32) {
        self.dispose_channel(channel, DisconnectReason::Local, true);
    }

    /// One service tick: drain the socket, then drive every channel's
    /// handshake, retransmission, and reclamation timers.
    pub fn update(self: &Arc<Self>, now_ms: u64) {
        let mut buf = [0u8; RECV_BUF];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok(Some((n, from))) => {
                    self.stats.packets_in.fetch_add(1, Ordering::Relaxed);
                    self.process_datagram(&buf[..n], from, now_ms);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%e, "socket receive failed");
                    break;
                }
            }
        }
        self.tick_channels(now_ms);
    }

    /// Run `update` on a dedicated thread until [`shutdown`](Self::shutdown).
    pub fn spawn_driver(self: &Arc<Self>, tick: Duration) -> thread::JoinHandle<()> {
        let service = self.clone();
        thread::spawn(move || {
            while !service.stopped.load(Ordering::Acquire) {
                service.update(service.now_ms());
                thread::sleep(tick);
            }
        })
    }

    /// Stop the driver and dispose every channel.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let ids: Vec<u32> = self.channels.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.dispose_channel(id, DisconnectReason::Local, true);
        }
    }

    fn process_datagram(self: &Arc<Self>, raw: &[u8], from: SocketAddr, now: u64) {
        match ControlDatagram::parse(raw) {
            Err(e) => debug!(peer = %from, %e, "malformed datagram dropped"),
            Ok(Some(ControlDatagram::Open { local_id })) => self.handle_open(from, local_id, now),
            Ok(Some(ControlDatagram::OpenAck {
                local_id,
                remote_id,
            })) => self.handle_open_ack(from, local_id, remote_id, now),
            Ok(Some(ControlDatagram::Reset { remote_id })) => self.handle_reset(from, remote_id),
            Ok(None) => self.handle_data(raw, from, now),
        }
    }

    fn handle_open(self: &Arc<Self>, from: SocketAddr, peer_id: u32, now: u64) {
        if let Some(ours) = self.accept_index.get(&(from, peer_id)).map(|e| *e.value()) {
            // Repeated probe: our OPEN_ACK was lost or is still in flight.
            self.send_control(
                from,
                ControlDatagram::OpenAck {
                    local_id: ours,
                    remote_id: peer_id,
                },
            );
            return;
        }

        let id = match self.alloc_server_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(peer = %from, %e, "cannot accept channel");
                return;
            }
        };
        let (inbound, frames) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel {
            local_id: id,
            peer: from,
            accepted: true,
            inner: Mutex::new(ChannelInner {
                // Stays Handshaking until the peer's first data datagram
                // proves it saw our OPEN_ACK.
                state: ChannelState::Handshaking,
                remote_id: peer_id,
                arq: ArqCodec::new(self.config.arq.clone()),
                frames: FrameBuffer::new(self.config.max_frame),
                pending: Vec::new(),
                inbound: Some(inbound),
                created_ms: now,
                last_recv_ms: now,
                last_probe_ms: now,
            }),
        });
        self.channels.insert(id, channel);
        self.accept_index.insert((from, peer_id), id);
        self.send_control(
            from,
            ControlDatagram::OpenAck {
                local_id: id,
                remote_id: peer_id,
            },
        );
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        info!(channel = id, peer = %from, "channel accepted");
        let _ = self
            .events
            .send(TransportEvent::Accepted(ChannelHandle::new(
                id,
                from,
                self.clone(),
                frames,
            )));
    }

    fn handle_open_ack(&self, from: SocketAddr, acceptor_id: u32, our_id: u32, now: u64) {
        let Some(channel) = self.channels.get(&our_id).map(|e| e.value().clone()) else {
            debug!(channel = our_id, peer = %from, "OPEN_ACK for unknown channel");
            return;
        };
        let mut inner = channel.inner.lock();
        inner.last_recv_ms = now;
        if inner.state != ChannelState::Handshaking {
            return;
        }
        inner.remote_id = acceptor_id;
        self.promote(&mut inner);
        info!(channel = our_id, remote = acceptor_id, peer = %from, "channel connected");
    }

    fn handle_reset(&self, from: SocketAddr, reset_id: u32) {
        if self.channels.contains_key(&reset_id) {
            debug!(channel = reset_id, peer = %from, "peer reset");
            self.dispose_channel(reset_id, DisconnectReason::Reset, false);
            return;
        }
        // A peer that never learned our id resets with its own view of the
        // channel: match on the remote id instead.
        let victim = self
            .channels
            .iter()
            .find(|e| e.value().peer == from && e.value().inner.lock().remote_id == reset_id)
            .map(|e| *e.key());
        if let Some(id) = victim {
            debug!(channel = id, peer = %from, "peer reset by remote id");
            self.dispose_channel(id, DisconnectReason::Reset, false);
        }
    }

    fn handle_data(self: &Arc<Self>, raw: &[u8], from: SocketAddr, now: u64) {
        let id = LittleEndian::read_u32(&raw[0..4]);
        let Some(channel) = self.channels.get(&id).map(|e| e.value().clone()) else {
            debug!(channel = id, peer = %from, "data for unknown channel, resetting peer");
            self.send_control(from, ControlDatagram::Reset { remote_id: id });
            self.stats.resets_sent.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut inner = channel.inner.lock();
        inner.last_recv_ms = now;
        if inner.state == ChannelState::Handshaking && channel.accepted {
            // First data completes the inbound handshake.
            self.promote(&mut inner);
            info!(channel = id, peer = %from, "channel connected");
        }

        if let Err(e) = inner.arq.input(&raw[4..]) {
            warn!(channel = id, %e, "undecodable segment, disposing channel");
            drop(inner);
            self.dispose_channel(id, DisconnectReason::Codec, true);
            return;
        }

        let mut fatal = false;
        while let Some(chunk) = inner.arq.recv() {
            inner.frames.push(&chunk);
        }
        loop {
            match inner.frames.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(tx) = &inner.inbound {
                        let _ = tx.send(frame);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(channel = id, %e, "frame decode failed, disposing channel");
                    fatal = true;
                    break;
                }
            }
        }
        drop(inner);
        if fatal {
            self.dispose_channel(id, DisconnectReason::Codec, true);
        }
    }

    /// Connected: move frames queued during the handshake into the ARQ
    /// stream in order.
    fn promote(&self, inner: &mut ChannelInner) {
        inner.state = ChannelState::Connected;
        let pending = mem::take(&mut inner.pending);
        for frame in pending {
            inner.arq.send(&frame);
        }
    }

    fn tick_channels(&self, now: u64) {
        let snapshot: Vec<Arc<Channel>> = self.channels.iter().map(|e| e.value().clone()).collect();
        let mut doomed: Vec<(u32, DisconnectReason)> = Vec::new();

        for channel in snapshot {
            let mut inner = channel.inner.lock();
            match inner.state {
                ChannelState::Handshaking if channel.accepted => {
                    if now.saturating_sub(inner.created_ms) >= self.config.connect_timeout_ms {
                        doomed.push((channel.local_id, DisconnectReason::ConnectTimeout));
                    }
                }
                ChannelState::Handshaking => {
                    if now.saturating_sub(inner.created_ms) >= self.config.connect_timeout_ms {
                        doomed.push((channel.local_id, DisconnectReason::ConnectTimeout));
                    } else if now.saturating_sub(inner.last_probe_ms)
                        >= self.config.probe_interval_ms
                    {
                        inner.last_probe_ms = now;
                        self.send_control(
                            channel.peer,
                            ControlDatagram::Open {
                                local_id: channel.local_id,
                            },
                        );
                    }
                }
                ChannelState::Connected => {
                    if now.saturating_sub(inner.last_recv_ms) >= self.config.idle_timeout_ms {
                        doomed.push((channel.local_id, DisconnectReason::Idle));
                        continue;
                    }
                    let mut out = Vec::new();
                    inner.arq.update(now, &mut out);
                    let remote = inner.remote_id;
                    for segment in &out {
                        self.send_data(channel.peer, remote, segment);
                    }
                    if inner.arq.is_dead() {
                        doomed.push((channel.local_id, DisconnectReason::DeadLink));
                    }
                }
                ChannelState::Disconnected => {}
            }
        }

        for (id, reason) in doomed {
            self.dispose_channel(id, reason, true);
        }
    }

    /// Exactly-once teardown: removal from the map is the guard.
    fn dispose_channel(&self, id: u32, reason: DisconnectReason, notify_peer: bool) {
        let Some((_, channel)) = self.channels.remove(&id) else {
            return;
        };
        let remote = {
            let mut inner = channel.inner.lock();
            inner.state = ChannelState::Disconnected;
            inner.inbound = None;
            inner.remote_id
        };
        self.accept_index.remove(&(channel.peer, remote));
        if notify_peer && remote != 0 {
            self.send_control(channel.peer, ControlDatagram::Reset { remote_id: remote });
            self.stats.resets_sent.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(
            reason,
            DisconnectReason::Idle | DisconnectReason::ConnectTimeout
        ) {
            self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
        }
        info!(channel = id, ?reason, "channel disposed");
        let _ = self
            .events
            .send(TransportEvent::Disconnected {
                channel: id,
                reason,
            });
    }

    fn send_control(&self, to: SocketAddr, datagram: ControlDatagram) {
        self.transmit(to, &datagram.encode());
    }

    /// Data datagrams carry the receiver's channel id, then the segment.
    fn send_data(&self, to: SocketAddr, remote_id: u32, segment: &[u8]) {
        let mut buf = BytesMut::with_capacity(4 + segment.len());
        buf.put_u32_le(remote_id);
        buf.put_slice(segment);
        self.transmit(to, &buf);
    }

    fn transmit(&self, to: SocketAddr, raw: &[u8]) {
        if let Err(e) = self.socket.send_to(raw, to) {
            debug!(peer = %to, %e, "datagram send failed");
            return;
        }
        self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    fn alloc_client_id(&self) -> Result<u32> {
        let span = CLIENT_ID_MAX - MIN_CHANNEL_ID + 1;
        for _ in 0..ALLOC_ATTEMPTS {
            let n = self.next_client.fetch_add(1, Ordering::Relaxed);
            let id = MIN_CHANNEL_ID + (n % span);
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(TransportError::IdsExhausted)
    }

    fn alloc_server_id(&self) -> Result<u32> {
        let span = (u32::MAX - SERVER_ID_MIN) + 1;
        for _ in 0..ALLOC_ATTEMPTS {
            let n = self.next_server.fetch_add(1, Ordering::Relaxed);
            let id = u32::MAX - (n % span);
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(TransportError::IdsExhausted)
    }
}
