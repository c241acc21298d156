//! The host supervisor.
//!
//! A [`Host`] owns the network loop and the table of connection actors. Its
//! [`Host::run`] loop polls for one event at a time, routes it to the right
//! actor, and flushes outgoing data:
//!
//! - `Connect`: create a handler, launch a [`ConnectionActor`], record it.
//! - `Receive`: enqueue the packet on the connection's actor and wake it.
//! - `Disconnect`: quit and wake the actor, then join it. The loop stalls
//!   until the actor has drained everything it was sent.
//!
//! [`HostSupervisor`] runs a `Host` on a dedicated thread and adds the
//! launch/stop/join lifecycle:
//!
//! ```text
//! Idle --launch--> Launched --request_stop--> Stopping --join--> Joined
//! ```
//!
//! Stopping the supervisor does not stop its actors; [`HostSupervisor::shutdown`]
//! does both.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mtnet_transport::{ConnectionId, Event, NetworkLoop, Outbox, Packet};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::actor::ConnectionActor;
use crate::error::DispatchError;
use crate::handler::{ConnectionContext, HandlerFactory};

/// Default bound on a single poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Default timeout for outbound connects.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default name of the supervisor thread; actor threads get it as a prefix.
pub const DEFAULT_THREAD_NAME: &str = "mtnet-host";

const SUPERVISOR: &str = "host supervisor";

// =============================================================================
// Configuration
// =============================================================================

/// Host supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on one poll; also bounds how long a stop request waits.
    pub poll_timeout: Duration,
    /// Timeout for [`HostSupervisor::connect`].
    pub connect_timeout: Duration,
    /// Supervisor thread name and actor thread name prefix.
    pub thread_name: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

// =============================================================================
// State and statistics
// =============================================================================

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Constructed; outbound connects allowed.
    Idle,
    /// Thread running the poll loop.
    Launched,
    /// Stop requested, loop not yet joined.
    Stopping,
    /// Thread joined.
    Joined,
}

/// Host counters.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    /// Actors created, inbound and outbound.
    pub connections_opened: AtomicU64,
    /// Actors currently mapped.
    pub connections_active: AtomicU64,
    /// Actors joined and removed.
    pub connections_closed: AtomicU64,
    /// Connections dropped because no actor could be started.
    pub connections_refused: AtomicU64,
    /// Packets handed to actors.
    pub packets_routed: AtomicU64,
    /// Events that broke connect-before-receive/disconnect ordering.
    pub ordering_violations: AtomicU64,
    /// Poll calls.
    pub polls: AtomicU64,
    /// Flush calls.
    pub flushes: AtomicU64,
}

/// Cooperative stop flag shared between a running host and its owners.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<Mutex<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to exit after its current iteration.
    pub fn request_stop(&self) {
        *self.requested.lock() = true;
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.requested.lock()
    }
}

// =============================================================================
// Host
// =============================================================================

/// Network loop plus connection table. Single-threaded.
pub struct Host<N: NetworkLoop, F: HandlerFactory> {
    net: N,
    factory: F,
    config: SupervisorConfig,
    actors: HashMap<ConnectionId, ConnectionActor>,
    /// Connections whose actor failed to start; their remaining events are dropped.
    refused: HashSet<ConnectionId>,
    outbox: Arc<dyn Outbox>,
    stats: Arc<SupervisorStats>,
}

impl<N: NetworkLoop, F: HandlerFactory> Host<N, F> {
    pub fn new(net: N, factory: F, config: SupervisorConfig) -> Self {
        let outbox = net.outbox();
        Self {
            net,
            factory,
            config,
            actors: HashMap::new(),
            refused: HashSet::new(),
            outbox,
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// Thread-safe send handle into the network loop.
    pub fn outbox(&self) -> Arc<dyn Outbox> {
        Arc::clone(&self.outbox)
    }

    pub fn network(&self) -> &N {
        &self.net
    }

    pub fn connection_count(&self) -> usize {
        self.actors.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.actors.contains_key(&id)
    }

    /// Start an actor for a new connection.
    pub fn on_connect(&mut self, id: ConnectionId, address: SocketAddr) -> Result<(), DispatchError> {
        if self.actors.contains_key(&id) {
            return Err(DispatchError::DuplicateConnection(id));
        }

        let ctx = ConnectionContext::new(id, address, Arc::clone(&self.outbox));
        let handler = self.factory.create(&ctx);
        let mut actor = ConnectionActor::new(ctx).with_thread_name(format!("{}-{}", self.config.thread_name, id));
        actor.launch(handler)?;

        self.actors.insert(id, actor);
        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        info!(connection_id = %id, address = %address, "Connection opened");
        Ok(())
    }

    /// Hand a received packet to its connection's actor.
    ///
    /// With no actor mapped for `id` the packet comes back in the error.
    pub fn on_receive(&mut self, id: ConnectionId, packet: Packet) -> Result<(), DispatchError> {
        let Some(actor) = self.actors.get(&id) else {
            if self.refused.contains(&id) {
                debug!(connection_id = %id, "Dropping packet for refused connection");
                return Ok(());
            }
            return Err(DispatchError::UnknownConnection {
                id,
                event: "receive",
                packet: Some(packet),
            });
        };

        actor.enqueue(packet)?;
        actor.wake();
        self.stats.packets_routed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop a connection's actor and wait until it has drained and exited.
    pub fn on_disconnect(&mut self, id: ConnectionId) -> Result<(), DispatchError> {
        let Some(mut actor) = self.actors.remove(&id) else {
            if self.refused.remove(&id) {
                return Ok(());
            }
            return Err(DispatchError::UnknownConnection {
                id,
                event: "disconnect",
                packet: None,
            });
        };

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);

        let report = actor.shutdown()?;
        info!(
            connection_id = %id,
            packets_handled = report.packets_handled,
            handler_faults = report.handler_faults,
            "Connection closed"
        );
        Ok(())
    }

    /// Route one event.
    pub fn dispatch(&mut self, event: Event) -> Result<(), DispatchError> {
        match event {
            Event::Connect { id, address } => self.on_connect(id, address),
            Event::Receive { id, packet } => self.on_receive(id, packet),
            Event::Disconnect { id } => self.on_disconnect(id),
        }
    }

    /// Open an outbound connection and start its actor.
    pub fn connect(&mut self, address: SocketAddr) -> Result<ConnectionId, DispatchError> {
        let id = self.net.connect(address, self.config.connect_timeout)?;
        if let Err(e) = self.on_connect(id, address) {
            if let Err(close) = self.net.disconnect(id) {
                warn!(connection_id = %id, error = %close, "Failed to close connection");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Poll, dispatch, and flush until `stop` is requested.
    ///
    /// Ordering violations and per-connection failures are logged and
    /// counted. A network loop failure ends the loop with an error.
    pub fn run(&mut self, stop: &StopHandle) -> Result<(), DispatchError> {
        info!(
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            "Host supervisor running"
        );

        while !stop.is_stop_requested() {
            self.stats.polls.fetch_add(1, Ordering::Relaxed);
            let event = self.net.poll(self.config.poll_timeout).inspect_err(|e| {
                error!(error = %e, "Network poll failed");
            })?;

            if let Some(event) = event {
                let id = event.connection_id();
                if let Err(e) = self.dispatch(event) {
                    self.handle_dispatch_error(id, e)?;
                }
            }

            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            self.net.flush().inspect_err(|e| {
                error!(error = %e, "Network flush failed");
            })?;
        }

        info!(connections = self.actors.len(), "Host supervisor stopped");
        Ok(())
    }

    fn handle_dispatch_error(&mut self, id: ConnectionId, err: DispatchError) -> Result<(), DispatchError> {
        match err {
            e if e.is_ordering_violation() => {
                self.stats.ordering_violations.fetch_add(1, Ordering::Relaxed);
                error!(connection_id = %id, error = %e, "Network event ordering violated");
                Ok(())
            }
            DispatchError::Spawn { name, source } => {
                self.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
                error!(connection_id = %id, thread = %name, error = %source, "Failed to start connection actor");
                self.refused.insert(id);
                if let Err(e) = self.net.disconnect(id) {
                    warn!(connection_id = %id, error = %e, "Failed to close refused connection");
                }
                Ok(())
            }
            e @ (DispatchError::ActorPanicked(_) | DispatchError::ActorStopped { .. }) => {
                error!(connection_id = %id, error = %e, "Connection actor failed");
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Quit, wake, and join every remaining actor, then close their
    /// connections.
    ///
    /// Returns the first actor failure after attempting all of them.
    pub fn close_all(&mut self) -> Result<(), DispatchError> {
        let mut first_error = None;
        let mut ids: Vec<_> = self.actors.keys().copied().collect();
        ids.sort();

        for &id in &ids {
            let Some(mut actor) = self.actors.remove(&id) else {
                continue;
            };
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);

            match actor.shutdown() {
                Ok(report) => debug!(
                    connection_id = %id,
                    packets_handled = report.packets_handled,
                    "Connection actor joined"
                ),
                Err(e) => {
                    error!(connection_id = %id, error = %e, "Connection actor failed to join");
                    first_error.get_or_insert(e);
                }
            }
        }

        // Replies queued during the final drains go out before the close.
        if let Err(e) = self.net.flush() {
            warn!(error = %e, "Final flush failed");
        }
        for id in ids {
            if let Err(e) = self.net.disconnect(id) {
                debug!(connection_id = %id, error = %e, "Connection already closed");
            }
        }
        self.refused.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// HostSupervisor
// =============================================================================

type RunOutcome<N, F> = (Host<N, F>, Result<(), DispatchError>);

/// Runs a [`Host`] on its own thread.
pub struct HostSupervisor<N: NetworkLoop, F: HandlerFactory> {
    host: Option<Host<N, F>>,
    thread: Option<JoinHandle<RunOutcome<N, F>>>,
    state: SupervisorState,
    stop: StopHandle,
    stats: Arc<SupervisorStats>,
    outbox: Arc<dyn Outbox>,
    thread_name: String,
}

impl<N: NetworkLoop, F: HandlerFactory> HostSupervisor<N, F> {
    pub fn new(net: N, factory: F, config: SupervisorConfig) -> Self {
        let thread_name = config.thread_name.clone();
        let host = Host::new(net, factory, config);
        Self {
            stats: Arc::clone(&host.stats),
            outbox: host.outbox(),
            host: Some(host),
            thread: None,
            state: SupervisorState::Idle,
            stop: StopHandle::new(),
            thread_name,
        }
    }

    /// Open an outbound connection. Only allowed before [`launch`](Self::launch).
    pub fn connect(&mut self, address: SocketAddr) -> Result<ConnectionId, DispatchError> {
        if self.state != SupervisorState::Idle {
            return Err(DispatchError::NotIdle);
        }
        let host = self.host.as_mut().ok_or(DispatchError::NotIdle)?;
        host.connect(address)
    }

    /// Thread-safe send handle, usable in any state.
    pub fn outbox(&self) -> Arc<dyn Outbox> {
        Arc::clone(&self.outbox)
    }

    /// Start the poll loop on its own thread.
    pub fn launch(&mut self) -> Result<(), DispatchError> {
        if self.state != SupervisorState::Idle {
            return Err(DispatchError::AlreadyLaunched(SUPERVISOR));
        }
        let mut host = self.host.take().ok_or(DispatchError::AlreadyLaunched(SUPERVISOR))?;

        let stop = self.stop.clone();
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                let result = host.run(&stop);
                (host, result)
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.state = SupervisorState::Launched;
                info!(thread = %self.thread_name, "Host supervisor launched");
                Ok(())
            }
            Err(source) => {
                // The host went down with the closure.
                self.state = SupervisorState::Joined;
                Err(DispatchError::Spawn {
                    name: self.thread_name.clone(),
                    source,
                })
            }
        }
    }

    /// Ask the poll loop to exit. Takes effect within one poll timeout.
    /// Running actors are left alone.
    pub fn request_stop(&self) {
        debug!("Host supervisor stop requested");
        self.stop.request_stop();
    }

    /// A handle that can request a stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the poll loop to exit and return how it ended.
    ///
    /// Blocks until a stop has been requested or the loop fails.
    pub fn join(&mut self) -> Result<(), DispatchError> {
        match self.state {
            SupervisorState::Idle => return Err(DispatchError::NotLaunched(SUPERVISOR)),
            SupervisorState::Joined => return Err(DispatchError::AlreadyJoined(SUPERVISOR)),
            SupervisorState::Launched | SupervisorState::Stopping => {}
        }
        let Some(handle) = self.thread.take() else {
            return Err(DispatchError::AlreadyJoined(SUPERVISOR));
        };

        self.state = SupervisorState::Joined;
        let (host, result) = handle.join().map_err(|_| DispatchError::SupervisorPanicked)?;
        self.host = Some(host);
        result
    }

    /// Stop the loop, join it, then quit, wake, and join every actor.
    ///
    /// Valid in every state. The first error encountered is returned.
    pub fn shutdown(&mut self) -> Result<(), DispatchError> {
        let run = match self.state {
            SupervisorState::Launched | SupervisorState::Stopping => {
                self.request_stop();
                self.join()
            }
            SupervisorState::Idle => {
                self.state = SupervisorState::Joined;
                Ok(())
            }
            SupervisorState::Joined => Ok(()),
        };

        let close = match self.host.as_mut() {
            Some(host) => host.close_all(),
            None => Ok(()),
        };
        run.and(close)
    }

    pub fn state(&self) -> SupervisorState {
        match self.state {
            SupervisorState::Launched if self.stop.is_stop_requested() => SupervisorState::Stopping,
            state => state,
        }
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// Actors currently mapped.
    pub fn connection_count(&self) -> usize {
        self.stats.connections_active.load(Ordering::Relaxed) as usize
    }

    /// The host, when the loop is not running.
    pub fn host(&self) -> Option<&Host<N, F>> {
        self.host.as_ref()
    }
}

impl<N: NetworkLoop, F: HandlerFactory> Drop for HostSupervisor<N, F> {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.request_stop();
        if let Err(e) = self.join() {
            warn!(error = %e, "Host supervisor ended with error on drop");
        }
        // Remaining actors are joined as the host drops.
    }
}
