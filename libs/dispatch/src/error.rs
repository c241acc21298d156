//! Error types for the dispatch core.

use mtnet_transport::{ConnectionId, Packet, SendError, TransportError};
use thiserror::Error;

/// Errors raised by connection actors and the host supervisor.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The network loop failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A worker thread could not be created.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// `join` was called before `launch`.
    #[error("{0} joined before it was launched")]
    NotLaunched(&'static str),

    /// `launch` was called twice.
    #[error("{0} launched twice")]
    AlreadyLaunched(&'static str),

    /// `join` was called twice.
    #[error("{0} already joined")]
    AlreadyJoined(&'static str),

    /// The operation is only allowed before the supervisor is launched.
    #[error("host supervisor is no longer idle")]
    NotIdle,

    /// An actor was joined without ever being told to quit.
    #[error("connection actor {0} joined without quit; it would never terminate")]
    JoinWithoutQuit(ConnectionId),

    /// An actor was told to quit while asleep and never woken.
    #[error("connection actor {0} told to quit but never woken; it would sleep forever")]
    QuitWithoutWake(ConnectionId),

    /// An event arrived for a connection with no actor.
    #[error("{event} for unknown connection {id}")]
    UnknownConnection {
        id: ConnectionId,
        event: &'static str,
        packet: Option<Packet>,
    },

    /// A connect arrived for a connection that already has an actor.
    #[error("connect for already mapped connection {0}")]
    DuplicateConnection(ConnectionId),

    /// The actor has terminated and no longer accepts packets.
    #[error("connection actor {id} has terminated")]
    ActorStopped { id: ConnectionId, packet: Packet },

    /// An actor thread died outside the handler's fault isolation.
    #[error("connection actor {0} thread panicked")]
    ActorPanicked(ConnectionId),

    /// The supervisor thread panicked.
    #[error("host supervisor thread panicked")]
    SupervisorPanicked,
}

impl DispatchError {
    /// Returns true for contract violations by the caller.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            DispatchError::NotLaunched(_)
                | DispatchError::AlreadyLaunched(_)
                | DispatchError::AlreadyJoined(_)
                | DispatchError::NotIdle
                | DispatchError::JoinWithoutQuit(_)
                | DispatchError::QuitWithoutWake(_)
        )
    }

    /// Returns true when the network loop broke its event ordering promise.
    pub fn is_ordering_violation(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownConnection { .. } | DispatchError::DuplicateConnection(_)
        )
    }

    /// Take back a packet that could not be delivered, if any.
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            DispatchError::UnknownConnection { packet, .. } => packet,
            DispatchError::ActorStopped { packet, .. } => Some(packet),
            _ => None,
        }
    }
}

/// Faults raised by a [`crate::Handler`].
///
/// These never leave the actor that raised them.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Logged; the actor continues with the next packet.
    #[error("recoverable handler error: {0}")]
    Recoverable(String),

    /// Logged; the actor stops calling its handler and discards packets
    /// until it is told to quit.
    #[error("fatal handler error: {0}")]
    Fatal(String),

    /// A send from inside the handler failed. Treated as recoverable.
    #[error(transparent)]
    Send(#[from] SendError),

    /// A close request from inside the handler failed. Treated as
    /// recoverable.
    #[error("close failed: {0}")]
    Close(#[from] TransportError),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtnet_transport::SendFailure;

    #[test]
    fn test_error_classification() {
        let id = ConnectionId::from_raw(3);
        assert!(DispatchError::QuitWithoutWake(id).is_usage_error());
        assert!(DispatchError::NotLaunched("host supervisor").is_usage_error());
        assert!(DispatchError::DuplicateConnection(id).is_ordering_violation());
        assert!(!DispatchError::SupervisorPanicked.is_usage_error());
    }

    #[test]
    fn test_into_packet() {
        let id = ConnectionId::from_raw(3);
        let err = DispatchError::UnknownConnection {
            id,
            event: "receive",
            packet: Some(Packet::reliable(&b"orphan"[..])),
        };
        assert_eq!(err.to_string(), "receive for unknown connection conn_3");
        assert_eq!(err.into_packet().unwrap().data(), b"orphan");
    }

    #[test]
    fn test_handler_error_from_send() {
        let send = SendError::new(
            ConnectionId::from_raw(1),
            Packet::reliable(&b"x"[..]),
            SendFailure::Closed,
        );
        let err = HandlerError::from(send);
        assert!(!err.is_fatal());
        assert!(HandlerError::Fatal("boom".to_string()).is_fatal());
    }
}
