//! Error types for the network loop contract.

use std::net::SocketAddr;

use thiserror::Error;

use crate::id::ConnectionId;
use crate::packet::Packet;

/// Errors raised by a network loop.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The network loop could not be created.
    #[error("failed to initialize network loop: {0}")]
    Init(String),

    /// An outbound connection was refused or timed out.
    #[error("connection to {address} failed: {reason}")]
    ConnectFailed { address: SocketAddr, reason: String },

    /// The connection is not known to the network loop.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a packet was rejected by an outbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    /// The connection is not (or no longer) live.
    #[error("connection is not live")]
    UnknownConnection,

    /// The network loop behind the outbox has gone away.
    #[error("network loop closed")]
    Closed,

    /// The packet cannot be carried by this network loop.
    #[error("packet rejected: {0}")]
    Rejected(String),
}

/// A rejected send.
///
/// Ownership of the packet goes back to the caller so it can be retried or
/// released.
#[derive(Debug, Error)]
#[error("send to {id} failed: {reason}")]
pub struct SendError {
    /// Target connection.
    pub id: ConnectionId,
    /// The packet that was not sent.
    pub packet: Packet,
    /// Rejection reason.
    pub reason: SendFailure,
}

impl SendError {
    /// Create a new send error.
    pub fn new(id: ConnectionId, packet: Packet, reason: SendFailure) -> Self {
        Self { id, packet, reason }
    }

    /// Take the packet back.
    pub fn into_packet(self) -> Packet {
        self.packet
    }
}

/// Errors that can occur when parsing a connection ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The numeric portion is invalid.
    #[error("invalid connection number: {0}")]
    InvalidNumber(String),
}
