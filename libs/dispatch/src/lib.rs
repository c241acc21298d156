//! # mtnet-dispatch
//!
//! Thread-per-connection dispatch on top of a single-threaded network loop.
//!
//! One supervisor thread owns the [`NetworkLoop`](mtnet_transport::NetworkLoop)
//! and polls it for events. Every connection gets a [`ConnectionActor`]: a
//! FIFO packet queue and a worker thread that runs the connection's
//! [`Handler`]. Packets for one connection are handled in arrival order on
//! that connection's thread; different connections never block each other.
//!
//! ```no_run
//! use mtnet_dispatch::{handler_fn, ConnectionContext, HostSupervisor, SupervisorConfig};
//! use mtnet_transport::{LoopbackNetwork, Packet};
//!
//! let (net, _controller) = LoopbackNetwork::new();
//! let echo = |_ctx: &ConnectionContext| {
//!     handler_fn(|ctx, packet: Packet| {
//!         ctx.reply(packet)?;
//!         Ok(())
//!     })
//! };
//!
//! let mut supervisor = HostSupervisor::new(net, echo, SupervisorConfig::default());
//! supervisor.launch()?;
//! // ...
//! supervisor.shutdown()?;
//! # Ok::<(), mtnet_dispatch::DispatchError>(())
//! ```

pub mod actor;
pub mod error;
pub mod handler;
pub mod supervisor;

pub use actor::{ActorReport, ActorState, ConnectionActor};
pub use error::{DispatchError, HandlerError};
pub use handler::{handler_fn, ConnectionContext, FnHandler, Handler, HandlerFactory, NoopHandler};
pub use supervisor::{
    Host, HostSupervisor, StopHandle, SupervisorConfig, SupervisorState, SupervisorStats,
};
