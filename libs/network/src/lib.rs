//! # Weft Channel Transport
//!
//! Reliable, ordered channels over an unreliable datagram socket.
//!
//! A [`ChannelService`] demultiplexes one socket into channels: a three-way
//! id exchange (OPEN / OPEN_ACK / first data) establishes each channel, a
//! per-channel ARQ codec makes the byte stream reliable and ordered, and a
//! length-prefixed frame layer restores message boundaries. Channels that
//! idle out, fail their handshake, or exhaust retransmissions are reclaimed
//! exactly once, with a [`TransportEvent::Disconnected`] notification and a
//! RESET to the peer.
//!
//! The socket sits behind the [`Datagram`] trait; [`UdpDatagram`] is the
//! real thing and [`MemoryDatagram`] is a deterministic in-process pair for
//! tests.

pub mod channel;
pub mod error;
pub mod service;
pub mod socket;

pub use channel::{ChannelHandle, ChannelState, DisconnectReason};
pub use error::{Result, TransportError};
pub use service::{ChannelService, ServiceConfig, TransportEvent, TransportStats};
pub use socket::{Datagram, MemoryDatagram, UdpDatagram};
