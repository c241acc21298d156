//! Connection actors.
//!
//! A [`ConnectionActor`] pairs one FIFO packet queue with one worker thread
//! dedicated to a single connection. The supervisor pushes packets in with
//! [`ConnectionActor::enqueue`] followed by [`ConnectionActor::wake`]; the
//! worker sleeps until woken, drains the queue through its [`Handler`], and
//! sleeps again.
//!
//! ## Lifecycle
//!
//! ```text
//! Created --launch--> Running (sleep -> drain)* --quit+wake--> Terminated --join--> Joined
//!                        \--fatal handler fault--> Failed (discarding) --quit+wake--> Terminated
//! ```
//!
//! ## Signals
//!
//! The queue, the wake predicate, and the quit flag live under the actor's
//! own lock. Wake and quit are independent: `quit` alone does not rouse a
//! sleeping actor. The actor exits only when, under its lock, the queue is
//! empty and quit is set, so everything enqueued before that point reaches
//! the handler. Enqueueing after that point hands the packet back.
//!
//! ## Handler faults
//!
//! The handler is always called with the lock released. A
//! [`HandlerError::Recoverable`] (or send failure) is logged and the actor
//! moves on. A [`HandlerError::Fatal`] or a panic puts the actor in
//! [`ActorState::Failed`]: the handler is not called again, further packets
//! are counted and discarded, and quit+wake still terminates the thread.

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mtnet_transport::{ConnectionId, Packet};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, HandlerError};
use crate::handler::{ConnectionContext, Handler};

const ACTOR: &str = "connection actor";

/// Observable actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Constructed, thread not started.
    Created,
    /// Thread running sleep/drain cycles.
    Running,
    /// Thread running, handler disabled after a fatal fault.
    Failed,
    /// Thread function has returned.
    Terminated,
    /// Thread joined.
    Joined,
}

/// Counters returned when an actor is joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorReport {
    /// Handler invocations.
    pub packets_handled: u64,
    /// Handler errors and panics.
    pub handler_faults: u64,
    /// Packets dropped after a fatal fault.
    pub packets_discarded: u64,
    /// Times the actor woke up and drained.
    pub drain_passes: u64,
}

#[derive(Debug, Default)]
struct MailboxState {
    queue: VecDeque<Packet>,
    /// Wake predicate.
    woken: bool,
    quit: bool,
    /// The worker is blocked waiting for `woken`.
    sleeping: bool,
    failed: bool,
    terminated: bool,
}

/// What the worker does next.
enum Next {
    Packet(Packet),
    Sleep,
    Exit,
}

#[derive(Debug, Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    /// Rouses the worker.
    wake: Condvar,
    /// Tells joiners the worker went to sleep or terminated.
    parked: Condvar,
}

impl Mailbox {
    fn push(&self, packet: Packet) -> Result<(), Packet> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(packet);
        }
        state.queue.push_back(packet);
        Ok(())
    }

    fn wake(&self) {
        self.state.lock().woken = true;
        self.wake.notify_one();
    }

    fn quit(&self) {
        self.state.lock().quit = true;
    }

    fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Block until the wake predicate is set, then consume it.
    fn sleep(&self) {
        let mut state = self.state.lock();
        if !state.woken {
            state.sleeping = true;
            self.parked.notify_all();
            while !state.woken {
                self.wake.wait(&mut state);
            }
            state.sleeping = false;
        }
        state.woken = false;
    }

    /// Pop the queue head, or decide between sleeping and exiting.
    fn next(&self) -> Next {
        let mut state = self.state.lock();
        if let Some(packet) = state.queue.pop_front() {
            return Next::Packet(packet);
        }
        if !state.quit {
            return Next::Sleep;
        }

        state.terminated = true;
        drop(state);
        self.parked.notify_all();
        Next::Exit
    }

    fn mark_failed(&self) {
        self.state.lock().failed = true;
    }

    fn mark_terminated(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        state.sleeping = false;
        drop(state);
        self.parked.notify_all();
    }

    /// Wait until the worker terminates, failing fast if it never will.
    fn wait_for_exit(&self, id: ConnectionId) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        loop {
            if state.terminated {
                return Ok(());
            }
            if !state.quit {
                return Err(DispatchError::JoinWithoutQuit(id));
            }
            if state.sleeping && !state.woken {
                return Err(DispatchError::QuitWithoutWake(id));
            }
            self.parked.wait(&mut state);
        }
    }
}

/// Marks the mailbox terminated however the worker exits, so joiners and
/// late enqueuers never wait on a dead thread.
struct ExitGuard<'a>(&'a Mailbox);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_terminated();
    }
}

/// One worker thread and FIFO queue serving one connection.
pub struct ConnectionActor {
    ctx: ConnectionContext,
    mailbox: Arc<Mailbox>,
    thread_name: String,
    thread: Option<JoinHandle<ActorReport>>,
    launched: bool,
    joined: bool,
}

impl ConnectionActor {
    /// Create an actor for the connection described by `ctx`.
    pub fn new(ctx: ConnectionContext) -> Self {
        Self {
            thread_name: ctx.id().to_string(),
            ctx,
            mailbox: Arc::new(Mailbox::default()),
            thread: None,
            launched: false,
            joined: false,
        }
    }

    /// Name for the worker thread.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.ctx.id()
    }

    pub fn address(&self) -> SocketAddr {
        self.ctx.address()
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Start the worker thread with `handler`.
    pub fn launch<H: Handler>(&mut self, handler: H) -> Result<(), DispatchError> {
        if self.launched {
            return Err(DispatchError::AlreadyLaunched(ACTOR));
        }

        let ctx = self.ctx.clone();
        let mailbox = Arc::clone(&self.mailbox);
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_actor(ctx, mailbox, handler))
            .map_err(|source| DispatchError::Spawn {
                name: self.thread_name.clone(),
                source,
            })?;

        self.thread = Some(handle);
        self.launched = true;
        debug!(connection_id = %self.id(), thread = %self.thread_name, "Connection actor launched");
        Ok(())
    }

    /// Append a packet to the queue. Follow with [`wake`](Self::wake).
    ///
    /// Fails, returning the packet, once the actor has terminated.
    pub fn enqueue(&self, packet: Packet) -> Result<(), DispatchError> {
        self.mailbox
            .push(packet)
            .map_err(|packet| DispatchError::ActorStopped {
                id: self.id(),
                packet,
            })
    }

    /// Set the wake predicate. Repeated calls before the actor runs coalesce.
    pub fn wake(&self) {
        self.mailbox.wake();
    }

    /// Ask the actor to stop after its next drain. Has no effect on a
    /// sleeping actor until [`wake`](Self::wake) is also called.
    pub fn quit(&self) {
        self.mailbox.quit();
    }

    /// Packets waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.mailbox.len()
    }

    pub fn state(&self) -> ActorState {
        if self.joined {
            return ActorState::Joined;
        }
        if !self.launched {
            return ActorState::Created;
        }

        let state = self.mailbox.state.lock();
        if state.terminated {
            ActorState::Terminated
        } else if state.failed {
            ActorState::Failed
        } else {
            ActorState::Running
        }
    }

    /// Wait for the worker to drain and terminate, then join it.
    ///
    /// Requires a prior [`quit`](Self::quit). Returns
    /// [`DispatchError::QuitWithoutWake`] instead of blocking forever when
    /// the actor is asleep with quit set and no wake pending.
    pub fn join(&mut self) -> Result<ActorReport, DispatchError> {
        if self.joined {
            return Err(DispatchError::AlreadyJoined(ACTOR));
        }
        let Some(handle) = self.thread.take() else {
            return Err(DispatchError::NotLaunched(ACTOR));
        };

        if let Err(e) = self.mailbox.wait_for_exit(self.id()) {
            self.thread = Some(handle);
            return Err(e);
        }

        self.joined = true;
        handle
            .join()
            .map_err(|_| DispatchError::ActorPanicked(self.id()))
    }

    /// `quit`, `wake`, then `join`.
    pub fn shutdown(&mut self) -> Result<ActorReport, DispatchError> {
        self.quit();
        self.wake();
        self.join()
    }
}

impl Drop for ConnectionActor {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!(connection_id = %self.id(), error = %e, "Connection actor shutdown on drop failed");
        }
    }
}

/// Why a packet did not make it through the handler.
enum Fault {
    Error(HandlerError),
    Panic(String),
}

impl Fault {
    fn is_fatal(&self) -> bool {
        match self {
            Fault::Error(e) => e.is_fatal(),
            Fault::Panic(_) => true,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Error(e) => write!(f, "{e}"),
            Fault::Panic(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

/// Worker thread body.
fn run_actor<H: Handler>(ctx: ConnectionContext, mailbox: Arc<Mailbox>, mut handler: H) -> ActorReport {
    let _exit = ExitGuard(&mailbox);
    let id = ctx.id();
    let mut report = ActorReport::default();
    let mut failed = false;

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.on_start(&ctx))) {
        error!(
            connection_id = %id,
            panic = %panic_message(payload.as_ref()),
            "Handler panicked in on_start"
        );
        report.handler_faults += 1;
        failed = true;
        mailbox.mark_failed();
    }

    debug!(connection_id = %id, address = %ctx.address(), "Connection actor started");

    'run: loop {
        mailbox.sleep();
        report.drain_passes += 1;

        loop {
            let packet = match mailbox.next() {
                Next::Packet(packet) => packet,
                Next::Sleep => break,
                Next::Exit => break 'run,
            };

            if failed {
                report.packets_discarded += 1;
                continue;
            }

            report.packets_handled += 1;
            let Err(fault) = deliver(&mut handler, &ctx, packet) else {
                continue;
            };

            report.handler_faults += 1;
            if fault.is_fatal() {
                error!(connection_id = %id, error = %fault, "Handler failed, discarding further packets");
                failed = true;
                mailbox.mark_failed();
            } else {
                warn!(connection_id = %id, error = %fault, "Handler error");
            }
        }
    }

    if !failed {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.on_stop(&ctx))) {
            error!(
                connection_id = %id,
                panic = %panic_message(payload.as_ref()),
                "Handler panicked in on_stop"
            );
            report.handler_faults += 1;
        }
    }

    info!(
        connection_id = %id,
        packets_handled = report.packets_handled,
        handler_faults = report.handler_faults,
        packets_discarded = report.packets_discarded,
        "Connection actor stopped"
    );
    report
}

fn deliver<H: Handler>(handler: &mut H, ctx: &ConnectionContext, packet: Packet) -> Result<(), Fault> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(ctx, packet))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Fault::Error(e)),
        Err(payload) => Err(Fault::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
