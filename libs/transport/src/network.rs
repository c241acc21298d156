//! The network loop contract.
//!
//! A network loop is a single-threaded, poll-driven event source. It
//! serializes connect, receive, and disconnect events for every connection
//! and hands them out one per [`NetworkLoop::poll`] call. For any given
//! connection, `Connect` happens before every `Receive` and the final
//! `Disconnect`.
//!
//! Sending is split out into an [`Outbox`]: a thread-safe handle with its
//! own lock, so that connection actors can queue outgoing packets while the
//! owning thread is blocked in `poll`. Queued packets go on the wire at the
//! next [`NetworkLoop::flush`], as do queued close requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SendError, TransportError};
use crate::id::ConnectionId;
use crate::packet::Packet;

/// One event produced by a network loop.
#[derive(Debug)]
pub enum Event {
    /// A remote peer connected.
    Connect {
        id: ConnectionId,
        address: SocketAddr,
    },
    /// A packet arrived. Ownership of the packet moves to the receiver.
    Receive { id: ConnectionId, packet: Packet },
    /// The connection is gone. No further events follow for `id`.
    Disconnect { id: ConnectionId },
}

impl Event {
    /// The connection this event belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Event::Connect { id, .. } | Event::Receive { id, .. } | Event::Disconnect { id } => *id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "connect",
            Event::Receive { .. } => "receive",
            Event::Disconnect { .. } => "disconnect",
        }
    }
}

/// Thread-safe send path into a network loop.
pub trait Outbox: Send + Sync + 'static {
    /// Queue a packet for `id`.
    ///
    /// On success the outbox owns the packet. On failure the packet comes
    /// back inside the error.
    fn send(&self, id: ConnectionId, packet: Packet) -> Result<(), SendError>;

    /// Ask the owning thread to close `id`.
    ///
    /// Sends to `id` fail from now on. Packets queued before the request
    /// still go out; the next flush then closes the connection the same way
    /// [`NetworkLoop::disconnect`] does, so a `Disconnect` event follows.
    fn close(&self, id: ConnectionId) -> Result<(), TransportError>;
}

/// A poll-driven network event source.
///
/// `poll`, `flush`, `connect`, and `disconnect` must only be called from the
/// thread that owns the loop.
pub trait NetworkLoop: Send + 'static {
    /// Wait at most `timeout` for the next event.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, TransportError>;

    /// Push queued outgoing packets onto the wire.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Open an outbound connection.
    ///
    /// The handshake completes inside this call; no `Connect` event is
    /// produced for the returned connection.
    fn connect(
        &mut self,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<ConnectionId, TransportError>;

    /// Close a connection from the local side.
    ///
    /// A `Disconnect` event for `id` is produced by a later `poll`.
    fn disconnect(&mut self, id: ConnectionId) -> Result<(), TransportError>;

    /// Handle for sending from other threads.
    fn outbox(&self) -> Arc<dyn Outbox>;

    /// Convenience for sending from the owning thread.
    fn send(&self, id: ConnectionId, packet: Packet) -> Result<(), SendError> {
        self.outbox().send(id, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_connection_id() {
        let id = ConnectionId::from_raw(7);
        let events = [
            Event::Connect {
                id,
                address: "127.0.0.1:9000".parse().unwrap(),
            },
            Event::Receive {
                id,
                packet: Packet::reliable(&b"x"[..]),
            },
            Event::Disconnect { id },
        ];

        let kinds: Vec<_> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, ["connect", "receive", "disconnect"]);
        assert!(events.iter().all(|e| e.connection_id() == id));
    }
}
