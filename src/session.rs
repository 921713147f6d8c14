//! Per-connection execution context.
//!
//! A [`Session`] decouples network I/O from command execution. The task
//! reading the socket pushes commands onto the bounded inbound queue with
//! [`Session::submit`], [`Session::run`] drains that queue and dispatches
//! every command through the engine, and the task writing the socket pulls
//! replies from the bounded outbound queue with [`Session::receive`]. A full
//! queue blocks its producer, which is the only back-pressure there is.
//!
//! Closing a queue lets its consumer drain what is already queued and then
//! finish. Stopping a session flips a shared cancellation flag that all three
//! tasks watch, so none of them stays blocked on a queue afterwards.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info};

use crate::{
    command::Command,
    engine::{CommandError, CommandResult, Engine, panic_message},
    resp::RespValue,
};

struct Queue<T> {
    sender: std::sync::Mutex<Option<mpsc::Sender<T>>>,
    receiver: Mutex<mpsc::Receiver<T>>,
}

impl<T> Queue<T> {
    fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
        }
    }

    /// `None` once the queue has been closed.
    fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drops the queue's sender. The receiver yields what is still queued and
    /// then `None`.
    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub struct Session {
    id: String,
    engine: Arc<Engine>,
    inbound: Option<Queue<Command>>,
    outbound: Option<Queue<RespValue>>,
    running: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl Session {
    /// Creates a session with both queues, sized from the engine config, and
    /// registers it with the engine.
    pub fn new(engine: &Arc<Engine>, id: impl Into<String>) -> Arc<Self> {
        let config = engine.config();
        let inbound = Queue::bounded(config.in_queue_capacity);
        let outbound = Queue::bounded(config.out_queue_capacity);

        Self::register(engine, id.into(), Some(inbound), Some(outbound))
    }

    /// Creates a session without queues, used to apply replicated writes.
    /// Nothing it dispatches produces a reply.
    pub fn pseudo(engine: &Arc<Engine>, id: impl Into<String>) -> Arc<Self> {
        Self::register(engine, id.into(), None, None)
    }

    fn register(
        engine: &Arc<Engine>,
        id: String,
        inbound: Option<Queue<Command>>,
        outbound: Option<Queue<RespValue>>,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            engine: Arc::clone(engine),
            inbound,
            outbound,
            running: AtomicBool::new(true),
            cancel,
        });

        engine.register_session(&session);
        debug!(session = session.id(), "created session");

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    /// Resolves once the session has been stopped.
    pub async fn stopped(&self) {
        let mut cancelled = self.cancel.subscribe();
        let _ = cancelled.wait_for(|stopped| *stopped).await;
    }

    /// Pushes a command onto the inbound queue, waiting while it is full.
    ///
    /// Returns `false` if the session has stopped or has no inbound queue.
    pub async fn submit(&self, command: Command) -> bool {
        let Some(sender) = self.inbound.as_ref().and_then(Queue::sender) else {
            return false;
        };

        if !self.is_running() {
            return false;
        }

        tokio::select! {
            sent = sender.send(command) => sent.is_ok(),
            _ = self.stopped() => false,
        }
    }

    /// The execution loop: dispatches queued commands one at a time, in
    /// order, until the session stops or its closed inbound queue runs dry.
    ///
    /// A failing command turns into an error reply and the loop moves on.
    /// `Engine::dispatch` already contains plugin panics; the boundary here is
    /// the last resort for a panic anywhere else in dispatch, reported as a
    /// `[RUNTIME]` error.
    pub async fn run(self: Arc<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };

        let mut receiver = inbound.receiver.lock().await;
        debug!(session = self.id(), "session loop started");

        while self.is_running() {
            let command = tokio::select! {
                command = receiver.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = self.stopped() => break,
            };

            let reply = match AssertUnwindSafe(self.engine.dispatch(&command, &self))
                .catch_unwind()
                .await
            {
                Ok(Ok(CommandResult::Response(value))) => Some(value),
                Ok(Ok(CommandResult::NoResponse)) => None,
                Ok(Err(err)) => Some(err.as_resp()),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(session = self.id(), "runtime error in session: {}", message);
                    Some(CommandError::RuntimeFault(message).as_resp())
                }
            };

            if let Some(reply) = reply {
                self.send(reply).await;
            }
        }

        debug!(session = self.id(), "session loop finished");
    }

    /// Pushes a reply onto the outbound queue, waiting while it is full.
    ///
    /// A no-op returning `false` once the session has stopped, or for a
    /// pseudo-session.
    pub async fn send(&self, reply: RespValue) -> bool {
        let Some(sender) = self.outbound.as_ref().and_then(Queue::sender) else {
            return false;
        };

        if !self.is_running() {
            return false;
        }

        tokio::select! {
            sent = sender.send(reply) => sent.is_ok(),
            _ = self.stopped() => false,
        }
    }

    /// Takes the next reply off the outbound queue.
    ///
    /// Returns `None` once the session has stopped, or once the outbound
    /// queue has been closed and drained.
    pub async fn receive(&self) -> Option<RespValue> {
        let outbound = self.outbound.as_ref()?;

        if !self.is_running() {
            return None;
        }

        let mut receiver = outbound.receiver.lock().await;

        tokio::select! {
            reply = receiver.recv() => reply,
            _ = self.stopped() => None,
        }
    }

    /// Stops accepting commands. `run` finishes the ones already queued and
    /// then returns.
    pub fn close_inbound(&self) {
        if let Some(inbound) = &self.inbound {
            inbound.close();
        }
    }

    /// Stops accepting replies. `receive` hands out the ones already queued
    /// and then returns `None`.
    pub fn close_outbound(&self) {
        if let Some(outbound) = &self.outbound {
            outbound.close();
        }
    }

    /// Stops the session for good. Idempotent.
    ///
    /// Deregisters the session (and any replication sink it backs) from the
    /// engine and wakes every task blocked on one of its queues. A command
    /// already being dispatched is allowed to finish.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(session = self.id(), "stopping session");
        self.cancel.send_replace(true);
        self.engine.deregister_session(&self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("pseudo", &self.outbound.is_none())
            .finish()
    }
}
