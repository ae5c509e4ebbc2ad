// src/lib.rs
//! Hermes: the concurrency core of an actor runtime.
//!
//! The engine is built from four pieces:
//!
//! * [`queue::NodeQueue`]: intrusive lock-free MPSC queue carrying user
//!   envelopes.
//! * [`system`]: the latest-first system-message chain and its
//!   reversal into delivery order.
//! * [`mailbox::Mailbox`]: per-actor state machine combining both
//!   queues with a packed status word.
//! * [`dispatcher::Dispatcher`]: the worker pool that runs mailboxes,
//!   one claim at a time.
//!
//! [`Runtime`] wires them together behind a small spawn/send/stop
//! surface. Payloads are opaque [`bytes::Bytes`]; interpretation
//! belongs to the actors.

pub mod dead_letters;
pub mod dispatcher;
pub mod mailbox;
pub mod queue;
pub mod registry;
pub mod system;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::dead_letters::LogDeadLetters;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::mailbox::LogTermination;
use crate::registry::ActorRegistry;

pub use crate::dead_letters::DeadLetterSink;
pub use crate::dispatcher::DispatchError;
pub use crate::mailbox::{Mailbox, MailboxOptions, SendError, TerminationHook};
pub use crate::system::SystemMessage;

/// Runtime-unique actor identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user message in flight: opaque payload plus optional sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Option<ActorId>,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(payload: Bytes) -> Self {
        Self {
            sender: None,
            payload,
        }
    }

    pub fn from_sender(sender: ActorId, payload: Bytes) -> Self {
        Self {
            sender: Some(sender),
            payload,
        }
    }
}

/// Failure surfaced by an actor's `receive`. Panics inside `receive`
/// are converted into the same escalation path.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ActorError(pub String);

impl From<&str> for ActorError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for ActorError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// What a supervisor decides for a failed child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Keep the child's state, lift its suspension.
    Resume,
    /// Run `pre_restart`, then lift the suspension.
    Restart,
    /// Terminate the child.
    Stop,
}

/// Behavior plugged into a mailbox. All hooks run on dispatcher
/// workers, serialized per actor by the mailbox's Scheduled claim, so
/// `&mut self` access is safe without further locking.
pub trait Actor: Send + 'static {
    /// Handle one user envelope. Returning an error (or panicking)
    /// suspends the actor and escalates to its supervisor.
    fn receive(&mut self, envelope: Envelope) -> Result<(), ActorError>;

    /// Runs before the first envelope is processed.
    fn pre_start(&mut self) {}

    /// Runs when a supervisor orders a restart after a failure.
    fn pre_restart(&mut self, _cause: &str) {}

    /// Runs once, when the mailbox closes.
    fn post_stop(&mut self) {}

    /// Decide the fate of a failed child. `uid` tags the child's
    /// incarnation so stale failures can be told apart.
    fn supervise(&mut self, _child: ActorId, _cause: &str, _uid: u64) -> Directive {
        Directive::Restart
    }
}

/// Tunables for [`Runtime::with_config`].
pub struct RuntimeConfig {
    pub workers: usize,
    pub throughput: usize,
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
    pub termination_hook: Option<Arc<dyn TerminationHook>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let dispatch = DispatcherConfig::default();
        Self {
            workers: dispatch.workers,
            throughput: dispatch.throughput,
            dead_letters: None,
            termination_hook: None,
        }
    }
}

/// Owner of the dispatcher, the registry, and id allocation.
pub struct Runtime {
    dispatcher: Dispatcher,
    registry: Arc<ActorRegistry>,
    dead_letters: Arc<dyn DeadLetterSink>,
    termination_hook: Arc<dyn TerminationHook>,
    next_id: AtomicU64,
    next_uid: AtomicU64,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: config.workers,
            throughput: config.throughput,
        });
        Self {
            dispatcher,
            registry: Arc::new(ActorRegistry::new()),
            dead_letters: config
                .dead_letters
                .unwrap_or_else(|| Arc::new(LogDeadLetters)),
            termination_hook: config
                .termination_hook
                .unwrap_or_else(|| Arc::new(LogTermination)),
            next_id: AtomicU64::new(1),
            next_uid: AtomicU64::new(1),
        }
    }

    /// Spawn a top-level actor (no supervisor) with default options.
    pub fn spawn<A: Actor>(&self, actor: A) -> ActorId {
        self.spawn_actor(Box::new(actor), MailboxOptions::default(), None)
    }

    /// Spawn with explicit mailbox options.
    pub fn spawn_with<A: Actor>(&self, actor: A, options: MailboxOptions) -> ActorId {
        self.spawn_actor(Box::new(actor), options, None)
    }

    /// Spawn under a supervisor. Returns `None` when the supervisor is
    /// not (or no longer) registered.
    pub fn spawn_supervised<A: Actor>(&self, actor: A, supervisor: ActorId) -> Option<ActorId> {
        let parent = self.registry.resolve(supervisor)?;
        Some(self.spawn_actor(Box::new(actor), MailboxOptions::default(), Some(parent)))
    }

    fn spawn_actor(
        &self,
        actor: Box<dyn Actor>,
        options: MailboxOptions,
        supervisor: Option<Arc<Mailbox>>,
    ) -> ActorId {
        let id = ActorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let parent_id = supervisor.as_ref().map(|mb| mb.id());
        let mailbox = Mailbox::new(
            id,
            uid,
            actor,
            options,
            self.dispatcher.clone(),
            self.registry.clone(),
            self.dead_letters.clone(),
            self.termination_hook.clone(),
            supervisor,
        );
        self.registry.register(mailbox.clone());
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.registry.resolve(parent_id) {
                parent.enqueue_system(SystemMessage::Supervise {
                    child: id,
                    async_registration: false,
                });
            }
        }
        mailbox.enqueue_system(SystemMessage::Create);
        tracing::debug!(actor = %id, uid, supervisor = ?parent_id, "spawned");
        id
    }

    /// Send a payload with no sender attached.
    ///
    /// # Errors
    ///
    /// [`SendError::UnknownActor`] when no mailbox is registered under
    /// `to` (the envelope is diverted to dead letters), or the mailbox's
    /// own rejection ([`SendError::Closed`], [`SendError::Full`]).
    pub fn send(&self, to: ActorId, payload: Bytes) -> Result<(), SendError> {
        self.deliver(to, Envelope::new(payload))
    }

    /// Send a payload carrying a sender id.
    pub fn send_from(&self, sender: ActorId, to: ActorId, payload: Bytes) -> Result<(), SendError> {
        self.deliver(to, Envelope::from_sender(sender, payload))
    }

    fn deliver(&self, to: ActorId, envelope: Envelope) -> Result<(), SendError> {
        match self.registry.resolve(to) {
            Some(mailbox) => mailbox.enqueue_user(envelope),
            None => {
                self.dead_letters.dead_letter(to, envelope);
                Err(SendError::UnknownActor(to))
            }
        }
    }

    /// Enqueue a control signal directly.
    pub fn send_system(&self, to: ActorId, message: SystemMessage) -> Result<(), SendError> {
        match self.registry.resolve(to) {
            Some(mailbox) => {
                mailbox.enqueue_system(message);
                Ok(())
            }
            None => Err(SendError::UnknownActor(to)),
        }
    }

    /// Register `watcher` for a termination notice when `watchee` closes.
    pub fn watch(&self, watchee: ActorId, watcher: ActorId) -> Result<(), SendError> {
        self.send_system(watchee, SystemMessage::Watch { watchee, watcher })
    }

    pub fn unwatch(&self, watchee: ActorId, watcher: ActorId) -> Result<(), SendError> {
        self.send_system(watchee, SystemMessage::Unwatch { watchee, watcher })
    }

    /// Ask an actor to stop. Messages already queued ahead of the
    /// Terminate are diverted to dead letters when it closes.
    pub fn stop(&self, id: ActorId) -> Result<(), SendError> {
        self.send_system(id, SystemMessage::Terminate)
    }

    pub fn mailbox(&self, id: ActorId) -> Option<Arc<Mailbox>> {
        self.registry.resolve(id)
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stop the worker pool. Idempotent. Mailboxes and their queued
    /// messages survive; only execution stops.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}
