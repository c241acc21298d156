//! TCP network loop.
//!
//! A non-blocking, single-threaded event loop built on mio. Each TCP
//! connection is one logical connection; frames are newline-delimited and
//! every frame becomes one reliable packet. TCP has no unreliable channel,
//! so unreliable packets are carried reliably.
//!
//! Outgoing packets and close requests are queued in a [`TcpOutbox`] (its
//! own lock) and the poll is woken through a `mio::Waker` so the owning
//! thread can flush promptly. The outbox also tracks which connections are
//! open, so a send to a closed connection fails at once and hands the
//! packet back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{SendError, SendFailure, TransportError};
use crate::id::ConnectionId;
use crate::network::{Event, NetworkLoop, Outbox};
use crate::packet::Packet;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Connection IDs double as mio tokens, so they start past the reserved ones.
const FIRST_CONNECTION_ID: u64 = 16;

/// Frame delimiter.
const DELIMITER: u8 = b'\n';

const READ_CHUNK: usize = 4096;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Default maximum frame length in bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Default mio event capacity per poll.
pub const DEFAULT_POLL_CAPACITY: usize = 256;

/// Configuration for a [`TcpNetwork`].
#[derive(Debug, Clone)]
pub struct TcpNetworkConfig {
    /// Address to accept connections on. `None` for a client-only loop.
    pub bind_addr: Option<SocketAddr>,
    /// Maximum concurrent connections; extra inbound connections are closed.
    pub max_connections: usize,
    /// Maximum frame length; longer frames drop the connection.
    pub max_frame_len: usize,
    /// mio event capacity per poll.
    pub poll_capacity: usize,
}

impl TcpNetworkConfig {
    /// Server configuration listening on `bind_addr`.
    pub fn listen(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr: Some(bind_addr),
            ..Self::client()
        }
    }

    /// Client configuration with no listener.
    pub fn client() -> Self {
        Self {
            bind_addr: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

/// Outbox for a [`TcpNetwork`].
pub struct TcpOutbox {
    state: Mutex<OutboxState>,
    waker: Waker,
    max_frame_len: usize,
}

#[derive(Default)]
struct OutboxState {
    queue: VecDeque<Outgoing>,
    /// Connections that are open and not asked to close.
    live: HashSet<ConnectionId>,
}

enum Outgoing {
    Packet(ConnectionId, Packet),
    Close(ConnectionId),
}

impl TcpOutbox {
    fn wake(&self, id: ConnectionId) {
        if let Err(e) = self.waker.wake() {
            warn!(connection_id = %id, error = %e, "Failed to wake TCP network loop");
        }
    }
}

impl Outbox for TcpOutbox {
    fn send(&self, id: ConnectionId, packet: Packet) -> Result<(), SendError> {
        if packet.data().contains(&DELIMITER) {
            return Err(SendError::new(
                id,
                packet,
                SendFailure::Rejected("payload contains the frame delimiter".to_string()),
            ));
        }
        if packet.len() > self.max_frame_len {
            let reason = format!("payload exceeds {} bytes", self.max_frame_len);
            return Err(SendError::new(id, packet, SendFailure::Rejected(reason)));
        }

        {
            let mut state = self.state.lock();
            if !state.live.contains(&id) {
                return Err(SendError::new(id, packet, SendFailure::UnknownConnection));
            }
            state.queue.push_back(Outgoing::Packet(id, packet));
        }
        self.wake(id);
        Ok(())
    }

    fn close(&self, id: ConnectionId) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if !state.live.remove(&id) {
                return Err(TransportError::UnknownConnection(id));
            }
            state.queue.push_back(Outgoing::Close(id));
        }
        debug!(connection_id = %id, "Close requested");
        self.wake(id);
        Ok(())
    }
}

struct Peer {
    stream: TcpStream,
    address: SocketAddr,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    writable_interest: bool,
}

/// Why a peer is being dropped.
enum Close {
    Eof,
    Local,
    Error(io::Error),
    FrameTooLong,
}

/// A mio-backed TCP network loop.
pub struct TcpNetwork {
    config: TcpNetworkConfig,
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    peers: HashMap<ConnectionId, Peer>,
    pending: VecDeque<Event>,
    outbox: Arc<TcpOutbox>,
    next_id: u64,
}

impl TcpNetwork {
    /// Create the loop, binding the listener if one is configured.
    pub fn bind(config: TcpNetworkConfig) -> Result<Self, TransportError> {
        let poll = Poll::new().map_err(|e| TransportError::Init(e.to_string()))?;
        let waker =
            Waker::new(poll.registry(), WAKER).map_err(|e| TransportError::Init(e.to_string()))?;

        let listener = match config.bind_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)
                    .map_err(|e| TransportError::Init(format!("bind {addr}: {e}")))?;
                poll.registry()
                    .register(&mut listener, LISTENER, Interest::READABLE)
                    .map_err(|e| TransportError::Init(e.to_string()))?;
                info!(bind_addr = %listener.local_addr()?, "TCP network listening");
                Some(listener)
            }
            None => None,
        };

        Ok(Self {
            events: Events::with_capacity(config.poll_capacity),
            outbox: Arc::new(TcpOutbox {
                state: Mutex::new(OutboxState::default()),
                waker,
                max_frame_len: config.max_frame_len,
            }),
            config,
            poll,
            listener,
            peers: HashMap::new(),
            pending: VecDeque::new(),
            next_id: FIRST_CONNECTION_ID,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    fn add_peer(&mut self, mut stream: TcpStream, address: SocketAddr) -> io::Result<ConnectionId> {
        let id = self.allocate_id();
        self.poll
            .registry()
            .register(&mut stream, token_for(id), Interest::READABLE)?;
        stream.set_nodelay(true)?;
        self.peers.insert(
            id,
            Peer {
                stream,
                address,
                read_buf: Vec::new(),
                write_buf: Vec::new(),
                writable_interest: false,
            },
        );
        self.outbox.state.lock().live.insert(id);
        Ok(id)
    }

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, address)) => {
                    if self.peers.len() >= self.config.max_connections {
                        warn!(
                            peer_addr = %address,
                            max_connections = self.config.max_connections,
                            "Connection rejected: max connections reached"
                        );
                        drop(stream);
                        continue;
                    }

                    match self.add_peer(stream, address) {
                        Ok(id) => {
                            info!(connection_id = %id, peer_addr = %address, "Accepted connection");
                            self.pending.push_back(Event::Connect { id, address });
                        }
                        Err(e) => warn!(peer_addr = %address, error = %e, "Failed to register connection"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    return;
                }
            }
        }
    }

    /// Read everything available, queueing one `Receive` per complete frame.
    fn read_peer(&mut self, id: ConnectionId) {
        let max_frame_len = self.config.max_frame_len;
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        let mut chunk = [0u8; READ_CHUNK];
        let close = loop {
            match peer.stream.read(&mut chunk) {
                Ok(0) => break Some(Close::Eof),
                Ok(n) => peer.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Some(Close::Error(e)),
            }
        };

        while let Some(pos) = peer.read_buf.iter().position(|b| *b == DELIMITER) {
            let mut frame: Vec<u8> = peer.read_buf.drain(..=pos).collect();
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            trace!(connection_id = %id, len = frame.len(), "Frame received");
            self.pending.push_back(Event::Receive {
                id,
                packet: Packet::reliable(frame),
            });
        }

        let close = match close {
            None if peer.read_buf.len() > max_frame_len => Some(Close::FrameTooLong),
            other => other,
        };

        if let Some(reason) = close {
            if matches!(reason, Close::Eof) && !peer.read_buf.is_empty() {
                let rest = std::mem::take(&mut peer.read_buf);
                self.pending.push_back(Event::Receive {
                    id,
                    packet: Packet::reliable(rest),
                });
            }
            self.close_peer(id, reason);
        }
    }

    /// Write as much buffered output as the socket takes.
    fn write_peer(&mut self, id: ConnectionId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        let mut written = 0;
        let close = loop {
            if written == peer.write_buf.len() {
                break None;
            }
            match peer.stream.write(&peer.write_buf[written..]) {
                Ok(0) => break Some(Close::Eof),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Some(Close::Error(e)),
            }
        };
        peer.write_buf.drain(..written);

        if let Some(reason) = close {
            self.close_peer(id, reason);
            return;
        }

        let wants_writable = !peer.write_buf.is_empty();
        if wants_writable != peer.writable_interest {
            let interest = if wants_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let result = self
                .poll
                .registry()
                .reregister(&mut peer.stream, token_for(id), interest);
            match result {
                Ok(()) => peer.writable_interest = wants_writable,
                Err(e) => self.close_peer(id, Close::Error(e)),
            }
        }
    }

    /// Drop a peer and queue its `Disconnect` behind any data already read.
    fn close_peer(&mut self, id: ConnectionId, reason: Close) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        self.outbox.state.lock().live.remove(&id);

        match reason {
            Close::Eof => info!(connection_id = %id, peer_addr = %peer.address, "Connection closed by peer"),
            Close::Local => info!(connection_id = %id, peer_addr = %peer.address, "Connection closed locally"),
            Close::Error(e) => warn!(connection_id = %id, peer_addr = %peer.address, error = %e, "Connection error"),
            Close::FrameTooLong => warn!(
                connection_id = %id,
                peer_addr = %peer.address,
                max_frame_len = self.config.max_frame_len,
                "Frame too long, dropping connection"
            ),
        }

        if let Err(e) = self.poll.registry().deregister(&mut peer.stream) {
            debug!(connection_id = %id, error = %e, "Deregister failed");
        }
        if let Err(e) = peer.stream.shutdown(Shutdown::Both) {
            debug!(connection_id = %id, error = %e, "Shutdown failed");
        }
        self.pending.push_back(Event::Disconnect { id });
    }
}

impl NetworkLoop for TcpNetwork {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, TransportError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.poll.poll(&mut self.events, Some(remaining)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable() || e.is_read_closed(), e.is_writable()))
                .collect();

            let mut woken = false;
            for (token, readable, writable) in ready {
                match token {
                    LISTENER => self.accept_connections(),
                    WAKER => woken = true,
                    Token(raw) => {
                        let id = ConnectionId::from_raw(raw as u64);
                        if writable {
                            self.write_peer(id);
                        }
                        if readable {
                            self.read_peer(id);
                        }
                    }
                }
            }

            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            // Outgoing packets are waiting; hand control back so the owner flushes.
            if woken || Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        let queued: Vec<_> = self.outbox.state.lock().queue.drain(..).collect();

        let mut touched = Vec::new();
        for outgoing in queued {
            match outgoing {
                Outgoing::Packet(id, packet) => match self.peers.get_mut(&id) {
                    Some(peer) => {
                        peer.write_buf.extend_from_slice(packet.data());
                        peer.write_buf.push(DELIMITER);
                        touched.push(id);
                    }
                    None => debug!(connection_id = %id, "Dropping packet for closed connection"),
                },
                // Writes what is buffered for the peer so far, then closes.
                Outgoing::Close(id) => {
                    if self.disconnect(id).is_err() {
                        debug!(connection_id = %id, "Close requested for connection already gone");
                    }
                }
            }
        }

        touched.sort();
        touched.dedup();
        for id in touched {
            self.write_peer(id);
        }
        Ok(())
    }

    fn connect(
        &mut self,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<ConnectionId, TransportError> {
        let connect_failed = |e: io::Error| TransportError::ConnectFailed {
            address,
            reason: e.to_string(),
        };

        let stream = std::net::TcpStream::connect_timeout(&address, timeout).map_err(connect_failed)?;
        stream.set_nonblocking(true).map_err(connect_failed)?;

        let id = self
            .add_peer(TcpStream::from_std(stream), address)
            .map_err(connect_failed)?;
        info!(connection_id = %id, peer_addr = %address, "Connected");
        Ok(id)
    }

    fn disconnect(&mut self, id: ConnectionId) -> Result<(), TransportError> {
        if !self.peers.contains_key(&id) {
            return Err(TransportError::UnknownConnection(id));
        }
        // Best effort: push out anything already queued for this peer first.
        self.write_peer(id);
        if self.peers.contains_key(&id) {
            self.close_peer(id, Close::Local);
        }
        Ok(())
    }

    fn outbox(&self) -> Arc<dyn Outbox> {
        Arc::clone(&self.outbox) as Arc<dyn Outbox>
    }
}

fn token_for(id: ConnectionId) -> Token {
    Token(id.raw() as usize)
}
