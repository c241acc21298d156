//! In-memory network loop.
//!
//! `LoopbackNetwork` has no sockets. A [`LoopbackController`] plays the
//! remote side: it injects connects, packets, and disconnects, decides
//! which addresses accept outbound connects, and observes what the local
//! side flushed. Useful for driving a host deterministically in tests and
//! for development without a real transport.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::{SendError, SendFailure, TransportError};
use crate::id::ConnectionId;
use crate::network::{Event, NetworkLoop, Outbox};
use crate::packet::Packet;

/// First ID handed out by a loopback network.
const FIRST_CONNECTION_ID: u64 = 1;

#[derive(Debug, Default)]
struct LoopbackState {
    /// Events waiting to be polled, in injection order.
    events: VecDeque<Event>,
    /// Connections that have connected and not yet been disconnected.
    live: HashSet<ConnectionId>,
    /// Addresses that accept outbound connects.
    reachable: HashSet<SocketAddr>,
    /// Packets written to the "wire" by flush.
    delivered: Vec<(ConnectionId, Packet)>,
    next_id: u64,
    polls: u64,
    flushes: u64,
}

impl LoopbackState {
    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::from_raw(self.next_id.max(FIRST_CONNECTION_ID));
        self.next_id = id.raw() + 1;
        id
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<LoopbackState>,
    /// Signalled when an event is injected.
    event_ready: Condvar,
    /// Signalled when flush delivers packets.
    delivered: Condvar,
}

/// Outbox for a loopback network.
///
/// Its locks nest inside the network state lock and are never held while
/// taking it.
#[derive(Debug)]
pub struct LoopbackOutbox {
    shared: Arc<Shared>,
    pending: Mutex<VecDeque<(ConnectionId, Packet)>>,
    closing: Mutex<Vec<ConnectionId>>,
    reject_sends: Mutex<Option<String>>,
}

impl Outbox for LoopbackOutbox {
    fn send(&self, id: ConnectionId, packet: Packet) -> Result<(), SendError> {
        if let Some(reason) = self.reject_sends.lock().clone() {
            return Err(SendError::new(id, packet, SendFailure::Rejected(reason)));
        }

        // The packet is queued under the state lock so a disconnect polled
        // concurrently either sees it queued or makes this send fail.
        let state = self.shared.state.lock();
        if !state.live.contains(&id) {
            return Err(SendError::new(id, packet, SendFailure::UnknownConnection));
        }

        trace!(connection_id = %id, len = packet.len(), "Queued loopback packet");
        self.pending.lock().push_back((id, packet));
        Ok(())
    }

    fn close(&self, id: ConnectionId) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !state.live.remove(&id) {
            return Err(TransportError::UnknownConnection(id));
        }

        debug!(connection_id = %id, "Loopback close requested");
        self.closing.lock().push(id);
        Ok(())
    }
}

/// An in-memory network loop.
pub struct LoopbackNetwork {
    shared: Arc<Shared>,
    outbox: Arc<LoopbackOutbox>,
}

impl LoopbackNetwork {
    /// Create a network and the controller that drives it.
    pub fn new() -> (Self, LoopbackController) {
        let shared = Arc::new(Shared::default());
        let outbox = Arc::new(LoopbackOutbox {
            shared: Arc::clone(&shared),
            pending: Mutex::new(VecDeque::new()),
            closing: Mutex::new(Vec::new()),
            reject_sends: Mutex::new(None),
        });

        let controller = LoopbackController {
            shared: Arc::clone(&shared),
            outbox: Arc::clone(&outbox),
        };

        (Self { shared, outbox }, controller)
    }
}

impl NetworkLoop for LoopbackNetwork {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        state.polls += 1;

        loop {
            if let Some(event) = state.events.pop_front() {
                if let Event::Disconnect { id } = &event {
                    state.live.remove(id);
                }
                return Ok(Some(event));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            self.shared.event_ready.wait_until(&mut state, deadline);
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        // Close requests first: anything sent before a request is already
        // in `pending` by the time it is seen here.
        let closing: Vec<_> = std::mem::take(&mut *self.outbox.closing.lock());
        let pending: Vec<_> = self.outbox.pending.lock().drain(..).collect();

        let mut state = self.shared.state.lock();
        state.flushes += 1;
        if pending.is_empty() && closing.is_empty() {
            return Ok(());
        }

        if !pending.is_empty() {
            debug!(count = pending.len(), "Flushing loopback packets");
            state.delivered.extend(pending);
        }
        for id in closing {
            let queued = state
                .events
                .iter()
                .any(|e| matches!(e, Event::Disconnect { id: gone } if *gone == id));
            if !queued {
                state.events.push_back(Event::Disconnect { id });
            }
        }
        drop(state);
        self.shared.delivered.notify_all();
        self.shared.event_ready.notify_one();
        Ok(())
    }

    fn connect(
        &mut self,
        address: SocketAddr,
        _timeout: Duration,
    ) -> Result<ConnectionId, TransportError> {
        let mut state = self.shared.state.lock();
        if !state.reachable.contains(&address) {
            return Err(TransportError::ConnectFailed {
                address,
                reason: "no loopback listener at address".to_string(),
            });
        }

        let id = state.allocate_id();
        state.live.insert(id);
        debug!(connection_id = %id, address = %address, "Loopback connect");
        Ok(id)
    }

    fn disconnect(&mut self, id: ConnectionId) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !state.live.contains(&id) {
            return Err(TransportError::UnknownConnection(id));
        }

        state.events.push_back(Event::Disconnect { id });
        drop(state);
        self.shared.event_ready.notify_one();
        Ok(())
    }

    fn outbox(&self) -> Arc<dyn Outbox> {
        Arc::clone(&self.outbox) as Arc<dyn Outbox>
    }
}

/// The remote side of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackController {
    shared: Arc<Shared>,
    outbox: Arc<LoopbackOutbox>,
}

impl LoopbackController {
    /// Simulate an inbound connection from `address`.
    pub fn connect_peer(&self, address: SocketAddr) -> ConnectionId {
        let mut state = self.shared.state.lock();
        let id = state.allocate_id();
        state.live.insert(id);
        state.events.push_back(Event::Connect { id, address });
        drop(state);
        self.shared.event_ready.notify_one();
        id
    }

    /// Simulate a packet arriving on `id`.
    ///
    /// Not validated against live connections, so tests can inject
    /// out-of-order events.
    pub fn receive(&self, id: ConnectionId, packet: Packet) {
        self.push_event(Event::Receive { id, packet });
    }

    /// Simulate the remote peer going away.
    pub fn disconnect_peer(&self, id: ConnectionId) {
        self.push_event(Event::Disconnect { id });
    }

    /// Inject an arbitrary event.
    pub fn push_event(&self, event: Event) {
        self.shared.state.lock().events.push_back(event);
        self.shared.event_ready.notify_one();
    }

    /// Accept outbound connects to `address`.
    pub fn listen(&self, address: SocketAddr) {
        self.shared.state.lock().reachable.insert(address);
    }

    /// Make every subsequent send fail with `reason`, or stop doing so.
    pub fn reject_sends(&self, reason: Option<&str>) {
        *self.outbox.reject_sends.lock() = reason.map(str::to_string);
    }

    /// Take everything flushed so far.
    pub fn take_delivered(&self) -> Vec<(ConnectionId, Packet)> {
        std::mem::take(&mut self.shared.state.lock().delivered)
    }

    /// Wait until at least `count` packets have been flushed, then take them.
    ///
    /// Returns whatever was delivered if the timeout expires first.
    pub fn wait_for_delivered(&self, count: usize, timeout: Duration) -> Vec<(ConnectionId, Packet)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.delivered.len() < count {
            if self
                .shared
                .delivered
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        std::mem::take(&mut state.delivered)
    }

    /// Whether `id` is currently connected.
    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.shared.state.lock().live.contains(&id)
    }

    /// Number of events not yet polled.
    pub fn pending_events(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    /// Number of poll calls so far.
    pub fn poll_count(&self) -> u64 {
        self.shared.state.lock().polls
    }

    /// Number of flush calls so far.
    pub fn flush_count(&self) -> u64 {
        self.shared.state.lock().flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_events_come_out_one_per_poll_in_order() {
        let (mut net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer(addr(4000));
        controller.receive(id, Packet::reliable(&b"a"[..]));
        controller.disconnect_peer(id);

        let timeout = Duration::from_millis(10);
        assert!(matches!(net.poll(timeout).unwrap(), Some(Event::Connect { .. })));
        match net.poll(timeout).unwrap() {
            Some(Event::Receive { packet, .. }) => assert_eq!(packet.data(), b"a"),
            other => panic!("expected receive, got {other:?}"),
        }
        assert!(controller.is_live(id));
        assert!(matches!(net.poll(timeout).unwrap(), Some(Event::Disconnect { .. })));
        assert!(!controller.is_live(id));
        assert!(net.poll(timeout).unwrap().is_none());
        assert_eq!(controller.poll_count(), 4);
    }

    #[test]
    fn test_poll_wakes_on_injected_event() {
        let (mut net, controller) = LoopbackNetwork::new();

        let injector = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            controller.connect_peer(addr(4001))
        });

        let event = net.poll(Duration::from_secs(5)).unwrap();
        let id = injector.join().unwrap();
        assert_eq!(event.map(|e| e.connection_id()), Some(id));
    }

    #[test]
    fn test_send_then_flush_delivers() {
        let (mut net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer(addr(4002));
        net.poll(Duration::ZERO).unwrap();

        net.send(id, Packet::reliable(&b"hello"[..])).unwrap();
        assert!(controller.take_delivered().is_empty());

        net.flush().unwrap();
        let delivered = controller.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, id);
        assert_eq!(delivered[0].1.data(), b"hello");
        assert_eq!(controller.flush_count(), 1);
    }

    #[test]
    fn test_send_to_unknown_connection_returns_packet() {
        let (net, _controller) = LoopbackNetwork::new();
        let err = net
            .send(ConnectionId::from_raw(99), Packet::reliable(&b"lost"[..]))
            .unwrap_err();
        assert_eq!(err.reason, SendFailure::UnknownConnection);
        assert_eq!(err.into_packet().data(), b"lost");
    }

    #[test]
    fn test_rejected_sends() {
        let (net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer(addr(4003));
        controller.reject_sends(Some("congested"));

        let err = net.send(id, Packet::reliable(&b"x"[..])).unwrap_err();
        assert_eq!(err.reason, SendFailure::Rejected("congested".to_string()));

        controller.reject_sends(None);
        assert!(net.send(id, err.into_packet()).is_ok());
    }

    #[test]
    fn test_connect_requires_listener() {
        let (mut net, controller) = LoopbackNetwork::new();
        let target = addr(5000);

        let err = net.connect(target, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));

        controller.listen(target);
        let id = net.connect(target, Duration::from_millis(10)).unwrap();
        assert!(controller.is_live(id));
        assert_eq!(controller.pending_events(), 0);
    }

    #[test]
    fn test_local_disconnect_produces_event() {
        let (mut net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer(addr(4004));
        net.poll(Duration::ZERO).unwrap();

        net.disconnect(id).unwrap();
        assert!(matches!(
            net.poll(Duration::ZERO).unwrap(),
            Some(Event::Disconnect { id: gone }) if gone == id
        ));
        assert!(matches!(
            net.disconnect(id),
            Err(TransportError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_close_request_applies_at_flush() {
        let (mut net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer(addr(4005));
        net.poll(Duration::ZERO).unwrap();

        let outbox = net.outbox();
        outbox.send(id, Packet::reliable(&b"last words"[..])).unwrap();
        outbox.close(id).unwrap();

        let err = outbox.send(id, Packet::reliable(&b"too late"[..])).unwrap_err();
        assert_eq!(err.reason, SendFailure::UnknownConnection);
        assert!(matches!(
            outbox.close(id),
            Err(TransportError::UnknownConnection(_))
        ));
        assert!(net.poll(Duration::ZERO).unwrap().is_none());

        net.flush().unwrap();
        let delivered = controller.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.data(), b"last words");
        assert!(matches!(
            net.poll(Duration::ZERO).unwrap(),
            Some(Event::Disconnect { id: gone }) if gone == id
        ));
        assert!(net.poll(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_close_request_does_not_duplicate_remote_disconnect() {
        let (mut net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer(addr(4006));
        net.poll(Duration::ZERO).unwrap();

        controller.disconnect_peer(id);
        net.outbox().close(id).unwrap();
        net.flush().unwrap();

        assert!(matches!(net.poll(Duration::ZERO).unwrap(), Some(Event::Disconnect { .. })));
        assert!(net.poll(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_send_fails_once_disconnect_is_polled() {
        let (mut net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer(addr(4007));
        net.poll(Duration::ZERO).unwrap();
        controller.disconnect_peer(id);

        // Queued before the disconnect is polled: delivered.
        net.send(id, Packet::reliable(&b"before"[..])).unwrap();
        net.poll(Duration::ZERO).unwrap();
        let err = net.send(id, Packet::reliable(&b"after"[..])).unwrap_err();
        assert_eq!(err.reason, SendFailure::UnknownConnection);

        net.flush().unwrap();
        let delivered = controller.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.data(), b"before");
    }
}
