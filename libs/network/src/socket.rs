//! Datagram socket abstraction
//!
//! The channel service talks to the wire through [`Datagram`], so the same
//! service code runs over real UDP and over an in-memory loopback pair. The
//! memory pair delivers reliably and in order; loss and reordering behavior
//! is exercised one layer down, against the ARQ codec.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Non-blocking datagram endpoint.
pub trait Datagram: Send + Sync {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()>;

    /// `Ok(None)` when no datagram is ready.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> SocketAddr;
}

/// Real UDP endpoint.
pub struct UdpDatagram {
    socket: UdpSocket,
    local: SocketAddr,
}

impl UdpDatagram {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Self { socket, local })
    }
}

impl Datagram for UdpDatagram {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(buf, to).map(|_| ())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // A previous send to a closed port surfaces here on some
            // platforms; the peer is simply gone.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

type Inbox = Arc<Mutex<VecDeque<(Bytes, SocketAddr)>>>;

static NEXT_MEMORY_PORT: AtomicU16 = AtomicU16::new(40_000);

/// In-memory loopback endpoint; see [`MemoryDatagram::pair`].
pub struct MemoryDatagram {
    local: SocketAddr,
    inbox: Inbox,
    peer_inbox: Inbox,
}

impl MemoryDatagram {
    /// Two connected endpoints. Every send on one side lands in the other
    /// side's inbox, whatever the destination address says.
    pub fn pair() -> (Self, Self) {
        let a_addr = next_addr();
        let b_addr = next_addr();
        let a_inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        let b_inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                local: a_addr,
                inbox: a_inbox.clone(),
                peer_inbox: b_inbox.clone(),
            },
            Self {
                local: b_addr,
                inbox: b_inbox,
                peer_inbox: a_inbox,
            },
        )
    }
}

fn next_addr() -> SocketAddr {
    let port = NEXT_MEMORY_PORT.fetch_add(1, Ordering::Relaxed);
    SocketAddr::from(([127, 0, 0, 1], port))
}

impl Datagram for MemoryDatagram {
    fn send_to(&self, buf: &[u8], _to: SocketAddr) -> io::Result<()> {
        self.peer_inbox
            .lock()
            .push_back((Bytes::copy_from_slice(buf), self.local));
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((data, from)) = self.inbox.lock().pop_front() else {
            return Ok(None);
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(Some((n, from)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
