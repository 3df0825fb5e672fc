//! The datagram transport the protocol core runs against.
//!
//! The core never touches sockets directly: it consumes a stream of
//! [`Event`]s -- datagrams tagged with the socket they arrived on -- and
//! asks the transport to send replies, open a fresh ephemeral socket for a
//! new session, or close one during teardown. The UDP implementation binds
//! a dual-stack IPv6 listening socket (IPv4 clients arrive as mapped
//! addresses) and runs one reader task per socket, all feeding the single
//! engine channel.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::timer::TimerToken;

/// Identifies one of the transport's sockets; `0` is always the listener.
pub type SocketId = u64;

/// Read buffer per socket. Deliberately larger than any legal TFTP frame so
/// an oversize datagram is observed at its real length and can be rejected,
/// rather than silently truncated to a valid-looking one.
pub const RECV_BUFLEN: usize = 4096;

/// Requested SO_RCVBUF/SO_SNDBUF size. Larger kernel buffers reduce drops
/// when many transfers land on the listener at once; the kernel is free to
/// round this.
pub const SOCKET_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// What the engine's event loop runs on.
#[derive(Debug)]
pub enum Event {
    Datagram {
        socket: SocketId,
        peer: SocketAddr,
        data: BytesMut,
    },
    TimerFired {
        peer: SocketAddr,
        socket: SocketId,
        token: TimerToken,
    },
}

/// Abstract asynchronous datagram transport.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// The well-known listening socket.
    fn listener(&self) -> SocketId;

    /// Opens an ephemeral socket in `peer`'s address family and subscribes
    /// it to the event stream. It becomes a new session's reply channel.
    async fn open_session_socket(&mut self, peer: SocketAddr) -> io::Result<SocketId>;

    async fn send_to(&self, socket: SocketId, peer: SocketAddr, data: &[u8]) -> io::Result<()>;

    /// Unsubscribes and closes a session socket.
    fn close(&mut self, socket: SocketId);
}

struct SocketEntry {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

pub struct UdpTransport {
    tx: mpsc::Sender<Event>,
    sockets: HashMap<SocketId, SocketEntry>,
    next_id: SocketId,
    listener: SocketId,
}

impl UdpTransport {
    /// Binds the listening socket and registers its reader. An IPv6 bind
    /// address is opened dual-stack so IPv4 clients are served too.
    pub fn bind(bind_addr: SocketAddr, tx: mpsc::Sender<Event>) -> io::Result<Self> {
        let socket = listening_socket(bind_addr)?;
        let mut transport = Self {
            tx,
            sockets: HashMap::new(),
            next_id: 0,
            listener: 0,
        };
        transport.listener = transport.register(socket);
        Ok(transport)
    }

    /// The listener's bound address, mainly for tests binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sockets[&self.listener].socket.local_addr()
    }

    fn register(&mut self, socket: UdpSocket) -> SocketId {
        let id = self.next_id;
        self.next_id += 1;
        let socket = Arc::new(socket);
        let reader = spawn_reader(id, Arc::clone(&socket), self.tx.clone());
        self.sockets.insert(id, SocketEntry { socket, reader });
        id
    }
}

impl Transport for UdpTransport {
    fn listener(&self) -> SocketId {
        self.listener
    }

    async fn open_session_socket(&mut self, peer: SocketAddr) -> io::Result<SocketId> {
        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = datagram_socket(bind, false)?;
        Ok(self.register(socket))
    }

    async fn send_to(&self, socket: SocketId, peer: SocketAddr, data: &[u8]) -> io::Result<()> {
        let entry = self
            .sockets
            .get(&socket)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "socket already closed"))?;
        entry.socket.send_to(data, peer).await?;
        Ok(())
    }

    fn close(&mut self, socket: SocketId) {
        if socket == self.listener {
            return;
        }
        if let Some(entry) = self.sockets.remove(&socket) {
            entry.reader.abort();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for entry in self.sockets.values() {
            entry.reader.abort();
        }
    }
}

fn listening_socket(bind_addr: SocketAddr) -> io::Result<UdpSocket> {
    datagram_socket(bind_addr, true)
}

/// Builds a tuned UDP socket: dual-stack for IPv6 binds, enlarged kernel
/// buffers, SO_REUSEADDR on the well-known port for fast restarts. Buffer
/// sizing is an optimization, so a refusal only costs a warning.
fn datagram_socket(bind_addr: SocketAddr, reuse_address: bool) -> io::Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if bind_addr.is_ipv6() {
        // Dual-stack: IPv4 requests arrive as ::ffff:a.b.c.d peers.
        socket.set_only_v6(false)?;
    }
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!("failed to set SO_RCVBUF to {} bytes: {}", SOCKET_BUFFER_BYTES, e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!("failed to set SO_SNDBUF to {} bytes: {}", SOCKET_BUFFER_BYTES, e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn spawn_reader(id: SocketId, socket: Arc<UdpSocket>, tx: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFLEN];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    let event = Event::Datagram {
                        socket: id,
                        peer,
                        data: BytesMut::from(&buf[..len]),
                    };
                    if tx.send(event).await.is_err() {
                        // The engine is gone; nothing left to deliver to.
                        break;
                    }
                }
                Err(e) => {
                    debug!("receive on socket {} failed: {}", id, e);
                }
            }
        }
    })
}
