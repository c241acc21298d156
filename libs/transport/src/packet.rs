//! Packets moved between the network loop and connection actors.

use bytes::Bytes;

/// Delivery guarantee requested for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    /// Delivered in order, retransmitted until acknowledged.
    #[default]
    Reliable,
    /// Best effort.
    Unreliable,
}

/// A payload plus its reliability marker.
///
/// Packets are deliberately not `Clone`: ownership moves from the network
/// loop into an actor queue, into `handle`, and into `send`. A failed send
/// hands the packet back inside [`crate::SendError`].
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    reliability: Reliability,
}

impl Packet {
    /// Create a packet.
    pub fn new(data: impl Into<Bytes>, reliability: Reliability) -> Self {
        Self {
            data: data.into(),
            reliability,
        }
    }

    /// Create a reliable packet.
    pub fn reliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, Reliability::Reliable)
    }

    /// Create an unreliable packet.
    pub fn unreliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, Reliability::Unreliable)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }

    /// Consume the packet, returning its payload.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}
