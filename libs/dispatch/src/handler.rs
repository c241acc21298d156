//! Per-connection packet handlers.
//!
//! Every connection actor owns one [`Handler`], created for it by the
//! supervisor's [`HandlerFactory`] when the connection arrives. The handler
//! runs only on that actor's thread, so it needs no internal locking.

use std::net::SocketAddr;
use std::sync::Arc;

use mtnet_transport::{ConnectionId, Outbox, Packet, SendError, TransportError};

use crate::error::HandlerError;

/// What a handler knows about its connection.
#[derive(Clone)]
pub struct ConnectionContext {
    id: ConnectionId,
    address: SocketAddr,
    outbox: Arc<dyn Outbox>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, address: SocketAddr, outbox: Arc<dyn Outbox>) -> Self {
        Self {
            id,
            address,
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Send path into the network loop, usable for any connection.
    pub fn outbox(&self) -> &Arc<dyn Outbox> {
        &self.outbox
    }

    /// Send a packet back on this connection.
    ///
    /// Goes through the outbox lock only; safe to call from `handle`.
    pub fn reply(&self, packet: Packet) -> Result<(), SendError> {
        self.outbox.send(self.id, packet)
    }

    /// Close this connection once replies already sent have gone out.
    ///
    /// The connection ends through the usual disconnect path: this handler
    /// keeps receiving whatever is already queued for it, then `on_stop`
    /// runs. Later replies fail.
    pub fn close(&self) -> Result<(), TransportError> {
        self.outbox.close(self.id)
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Processes the packets of one connection, in arrival order.
///
/// Every method has a no-op default.
pub trait Handler: Send + 'static {
    /// Called on the actor thread before the first packet.
    fn on_start(&mut self, _ctx: &ConnectionContext) {}

    /// Handle one packet. Never called concurrently with itself.
    fn handle(&mut self, _ctx: &ConnectionContext, _packet: Packet) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called on the actor thread after the final drain.
    fn on_stop(&mut self, _ctx: &ConnectionContext) {}
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn on_start(&mut self, ctx: &ConnectionContext) {
        (**self).on_start(ctx)
    }

    fn handle(&mut self, ctx: &ConnectionContext, packet: Packet) -> Result<(), HandlerError> {
        (**self).handle(ctx, packet)
    }

    fn on_stop(&mut self, ctx: &ConnectionContext) {
        (**self).on_stop(ctx)
    }
}

/// A handler that ignores every packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {}

/// Adapter turning a closure into a [`Handler`]. See [`handler_fn`].
pub struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: FnMut(&ConnectionContext, Packet) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(&mut self, ctx: &ConnectionContext, packet: Packet) -> Result<(), HandlerError> {
        (self.0)(ctx, packet)
    }
}

/// Build a handler from a closure.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&ConnectionContext, Packet) -> Result<(), HandlerError> + Send + 'static,
{
    FnHandler(f)
}

/// Creates the handler for each new connection.
///
/// Called on the supervisor thread, once per connection, before the
/// connection's actor is launched. Implemented for closures of the form
/// `FnMut(&ConnectionContext) -> H`.
pub trait HandlerFactory: Send + 'static {
    type Handler: Handler;

    fn create(&mut self, ctx: &ConnectionContext) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: FnMut(&ConnectionContext) -> H + Send + 'static,
    H: Handler,
{
    type Handler = H;

    fn create(&mut self, ctx: &ConnectionContext) -> H {
        self(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtnet_transport::{LoopbackNetwork, NetworkLoop};

    fn context() -> ConnectionContext {
        let (net, _controller) = LoopbackNetwork::new();
        ConnectionContext::new(
            ConnectionId::from_raw(1),
            "127.0.0.1:7000".parse().unwrap(),
            net.outbox(),
        )
    }

    #[test]
    fn test_noop_handler_accepts_everything() {
        let ctx = context();
        let mut handler = NoopHandler;
        handler.on_start(&ctx);
        assert!(handler.handle(&ctx, Packet::reliable(&b"x"[..])).is_ok());
        handler.on_stop(&ctx);
    }

    #[test]
    fn test_handler_fn() {
        let ctx = context();
        let mut seen = Vec::new();
        let mut handler = handler_fn(move |_ctx, packet: Packet| {
            seen.push(packet.len());
            if seen.len() > 1 {
                return Err(HandlerError::Recoverable("second packet".to_string()));
            }
            Ok(())
        });

        assert!(handler.handle(&ctx, Packet::reliable(&b"abc"[..])).is_ok());
        assert!(handler.handle(&ctx, Packet::reliable(&b"de"[..])).is_err());
    }

    #[test]
    fn test_closure_factory() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ctx = context();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let mut factory = move |_ctx: &ConnectionContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            NoopHandler
        };
        let _handler = HandlerFactory::create(&mut factory, &ctx);
        let _handler = HandlerFactory::create(&mut factory, &ctx);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reply_to_dead_connection_returns_packet() {
        let ctx = context();
        let err = ctx.reply(Packet::reliable(&b"back"[..])).unwrap_err();
        assert_eq!(err.id, ctx.id());
        assert_eq!(err.into_packet().data(), b"back");
    }

    #[test]
    fn test_close_stops_replies() {
        let (mut net, controller) = LoopbackNetwork::new();
        let id = controller.connect_peer("127.0.0.1:7001".parse().unwrap());
        net.poll(std::time::Duration::ZERO).unwrap();
        let ctx = ConnectionContext::new(id, "127.0.0.1:7001".parse().unwrap(), net.outbox());

        ctx.reply(Packet::reliable(&b"bye"[..])).unwrap();
        ctx.close().unwrap();
        assert!(ctx.reply(Packet::reliable(&b"more"[..])).is_err());
        assert!(matches!(ctx.close(), Err(TransportError::UnknownConnection(_))));
    }
}
