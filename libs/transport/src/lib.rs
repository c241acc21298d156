//! # mtnet-transport
//!
//! The network loop contract consumed by the mtnet dispatch core.
//!
//! A network loop is a single-threaded, poll-driven source of connect,
//! receive, and disconnect events, one per poll call. This crate defines:
//!
//! - [`ConnectionId`], [`Packet`], [`Reliability`], and [`Event`]
//! - [`NetworkLoop`]: poll/flush/connect/disconnect, owned by one thread
//! - [`Outbox`]: the thread-safe send path with its own lock
//! - [`loopback`]: an in-memory implementation driven by a controller
//! - [`tcp`]: a mio-based TCP implementation with newline framing
//!
//! Reliability, retransmission, and wire encoding belong to the concrete
//! network loop; the contract only moves packets and events.

mod error;
mod id;
mod network;
mod packet;

pub mod loopback;
pub mod tcp;

pub use error::{IdError, SendError, SendFailure, TransportError};
pub use id::ConnectionId;
pub use network::{Event, NetworkLoop, Outbox};
pub use packet::{Packet, Reliability};

pub use loopback::{LoopbackController, LoopbackNetwork};
pub use tcp::{TcpNetwork, TcpNetworkConfig};
