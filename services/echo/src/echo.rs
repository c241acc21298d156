//! The echo handler.
//!
//! Every connection gets its own [`EchoHandler`], running on that
//! connection's actor thread. Each packet is logged and sent straight back
//! with the same reliability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mtnet_dispatch::{ConnectionContext, Handler, HandlerError, HandlerFactory};
use mtnet_transport::Packet;
use tracing::{debug, info};

/// Totals across all connections served by one factory.
#[derive(Debug, Default)]
pub struct EchoStats {
    pub connections: AtomicU64,
    pub packets_echoed: AtomicU64,
    pub bytes_echoed: AtomicU64,
}

/// Creates an [`EchoHandler`] per connection.
#[derive(Debug, Clone, Default)]
pub struct EchoFactory {
    stats: Arc<EchoStats>,
}

impl EchoFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<EchoStats> {
        Arc::clone(&self.stats)
    }
}

impl HandlerFactory for EchoFactory {
    type Handler = EchoHandler;

    fn create(&mut self, _ctx: &ConnectionContext) -> EchoHandler {
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        EchoHandler {
            echoed: 0,
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Sends every packet back to where it came from.
#[derive(Debug)]
pub struct EchoHandler {
    echoed: u64,
    stats: Arc<EchoStats>,
}

impl Handler for EchoHandler {
    fn on_start(&mut self, ctx: &ConnectionContext) {
        debug!(connection_id = %ctx.id(), address = %ctx.address(), "Echo session started");
    }

    fn handle(&mut self, ctx: &ConnectionContext, packet: Packet) -> Result<(), HandlerError> {
        info!(
            connection_id = %ctx.id(),
            address = %ctx.address(),
            data = %String::from_utf8_lossy(packet.data()),
            "Echoing packet"
        );

        let len = packet.len() as u64;
        let reliability = packet.reliability();
        let reply = Packet::new(packet.into_bytes(), reliability);
        ctx.reply(reply)?;

        self.echoed += 1;
        self.stats.packets_echoed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_echoed.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &ConnectionContext) {
        info!(connection_id = %ctx.id(), packets_echoed = self.echoed, "Echo session ended");
    }
}
