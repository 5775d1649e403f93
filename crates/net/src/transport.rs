//! Datagram socket abstraction.
//!
//! The tick loops poll [`Socket::poll_recv`] until it runs dry, once per
//! tick; nothing in the core ever blocks on the network. [`UdpTransport`]
//! is the real thing; [`MemoryNetwork`] hands out in-process sockets with
//! deterministic delivery (and optional loss) for tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Unreliable datagram endpoint consumed by the protocol core.
pub trait Socket {
    /// Send one datagram; best effort, loss is fine.
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()>;

    /// Fetch one pending datagram, if any, without blocking.
    fn poll_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>>;
}

/// Non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `addr` and switch the socket to non-blocking mode.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        socket
            .set_nonblocking(true)
            .context("failed to set socket non-blocking")?;
        info!("UDP socket bound on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    /// Address the socket actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Socket for UdpTransport {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        match self.socket.send_to(data, to) {
            Ok(_) => Ok(()),
            // Full send buffers are packet loss, which the protocol absorbs.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!("send buffer full, datagram dropped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((from, len))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // Some platforms surface ICMP unreachable as a recv error on
            // the next read; that is peer loss, not a socket failure.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                debug!("recv reported connection reset, ignoring");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

type Mailboxes = Rc<RefCell<HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>>>;

/// In-process datagram fabric for deterministic single-threaded tests.
#[derive(Default, Clone)]
pub struct MemoryNetwork {
    mailboxes: Mailboxes,
    drop_next: Rc<RefCell<u32>>,
}

impl MemoryNetwork {
    /// Fresh, empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a socket reachable at `addr`.
    pub fn socket(&self, addr: SocketAddr) -> MemorySocket {
        self.mailboxes.borrow_mut().entry(addr).or_default();
        MemorySocket {
            addr,
            network: self.clone(),
        }
    }

    /// Silently discard the next `count` datagrams, whoever sends them.
    pub fn drop_next(&self, count: u32) {
        *self.drop_next.borrow_mut() += count;
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        {
            let mut pending = self.drop_next.borrow_mut();
            if *pending > 0 {
                *pending -= 1;
                return;
            }
        }
        if let Some(queue) = self.mailboxes.borrow_mut().get_mut(&to) {
            queue.push_back((from, data.to_vec()));
        }
        // Datagrams to unbound addresses vanish, like real UDP.
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl MemorySocket {
    /// The address this socket receives on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Socket for MemorySocket {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.network.deliver(self.addr, to, data);
        Ok(())
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        let mut mailboxes = self.network.mailboxes.borrow_mut();
        let Some(queue) = mailboxes.get_mut(&self.addr) else {
            return Ok(None);
        };
        match queue.pop_front() {
            Some((from, data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some((from, len)))
            }
            None => Ok(None),
        }
    }
}
