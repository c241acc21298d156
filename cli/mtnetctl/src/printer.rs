//! Prints received packets.

use std::io::Write;

use mtnet_dispatch::{ConnectionContext, Handler, HandlerError};
use mtnet_transport::Packet;

/// Writes each received packet as a `recv: ...` line.
pub struct PrintHandler<W> {
    out: W,
}

impl<W: Write + Send + 'static> PrintHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl PrintHandler<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send + 'static> Handler for PrintHandler<W> {
    fn handle(&mut self, _ctx: &ConnectionContext, packet: Packet) -> Result<(), HandlerError> {
        writeln!(self.out, "{}", format_received(packet.data()))
            .and_then(|()| self.out.flush())
            .map_err(|e| HandlerError::Recoverable(format!("failed to print packet: {e}")))
    }

    fn on_stop(&mut self, ctx: &ConnectionContext) {
        let _ = writeln!(self.out, "disconnected from {}", ctx.address());
    }
}

pub fn format_received(data: &[u8]) -> String {
    format!("recv: {}", String::from_utf8_lossy(data))
}
