// src/mailbox.rs
//! Per-actor mailbox: user queue, system channel, and the processing run.
//!
//! Each mailbox owns one [`NodeQueue`] of user envelopes and one
//! latest-first system chain, plus a status word that packs the
//! Open/Scheduled/Closed state together with a suspend counter:
//!
//! ```text
//!   bit 0: Closed (terminal)
//!   bit 1: Scheduled (claimed by, or queued for, a worker)
//!   bits 2..: suspend count, in units of 4
//! ```
//!
//! The Scheduled bit is the mutual-exclusion token for the whole engine:
//! a mailbox is only handed to a worker after a successful
//! `set_as_scheduled` transition, so at most one thread ever runs
//! `run()`, which is what licenses the single-consumer operations on
//! both queues.
//!
//! A producer that enqueues while the bit is already set relies on the
//! running worker's post-run recheck (`dispatcher.rs`) to pick the
//! message up, so no wakeup is ever lost.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

use crate::dead_letters::DeadLetterSink;
use crate::dispatcher::Dispatcher;
use crate::queue::NodeQueue;
use crate::registry::ActorRegistry;
use crate::system::{SystemMessage, SystemQueue};
use crate::{Actor, ActorId, Directive, Envelope};

const CLOSED: usize = 0b01;
const SCHEDULED: usize = 0b10;
const SHOULD_SCHEDULE_MASK: usize = 0b11;
const SUSPEND_UNIT: usize = 4;

/// Sending failed; bounded-full rejections hand the envelope back.
#[derive(Debug, Error)]
pub enum SendError {
    /// The mailbox processed a Terminate; the message went to dead letters.
    #[error("mailbox is closed")]
    Closed,
    /// Bounded mailbox at capacity (drop-new policy).
    #[error("mailbox is full")]
    Full(Envelope),
    /// No mailbox registered under this id.
    #[error("no such actor: {0}")]
    UnknownActor(ActorId),
}

/// Invoked exactly once when a mailbox transitions to Closed, carrying
/// the watchers recorded by `Watch` so the surrounding watch subsystem
/// can notify them.
pub trait TerminationHook: Send + Sync {
    fn mailbox_closed(&self, actor: ActorId, watchers: &[ActorId]);
}

/// Default hook: records the closure in the log.
pub struct LogTermination;

impl TerminationHook for LogTermination {
    fn mailbox_closed(&self, actor: ActorId, watchers: &[ActorId]) {
        tracing::debug!(actor = %actor, watchers = watchers.len(), "mailbox closed");
    }
}

/// Per-mailbox tunables.
#[derive(Clone, Debug, Default)]
pub struct MailboxOptions {
    /// Maximum queued user messages; `None` is unbounded. Overflow is
    /// drop-new: the rejected envelope is returned to the sender.
    /// System messages always bypass capacity.
    pub capacity: Option<usize>,
}

/// Mutable actor state. Only touched from inside `run()`, which the
/// Scheduled bit serializes, so the lock is never contended.
struct Cell {
    actor: Box<dyn Actor>,
    watchers: Vec<ActorId>,
    children: Vec<ActorId>,
}

pub struct Mailbox {
    id: ActorId,
    /// Incarnation tag carried on `Failed` escalations.
    uid: u64,
    status: AtomicUsize,
    queue: NodeQueue<Envelope>,
    system: SystemQueue,
    /// Approximate queued user-message count. Capacity checks and
    /// `len()` read it; it is maintained beside the queue rather than
    /// derived from it so producers never have to walk the chain.
    queued: AtomicUsize,
    capacity: Option<usize>,
    cell: Mutex<Cell>,
    dispatcher: Dispatcher,
    /// Weak because the registry holds the strong handle to every
    /// mailbox; a strong backlink would keep both alive forever.
    registry: Weak<ActorRegistry>,
    dead_letters: Arc<dyn DeadLetterSink>,
    termination_hook: Arc<dyn TerminationHook>,
    supervisor: Option<Arc<Mailbox>>,
}

impl Mailbox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ActorId,
        uid: u64,
        actor: Box<dyn Actor>,
        options: MailboxOptions,
        dispatcher: Dispatcher,
        registry: Arc<ActorRegistry>,
        dead_letters: Arc<dyn DeadLetterSink>,
        termination_hook: Arc<dyn TerminationHook>,
        supervisor: Option<Arc<Mailbox>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            uid,
            status: AtomicUsize::new(0),
            queue: NodeQueue::new(),
            system: SystemQueue::new(),
            queued: AtomicUsize::new(0),
            capacity: options.capacity,
            cell: Mutex::new(Cell {
                actor,
                watchers: Vec::new(),
                children: Vec::new(),
            }),
            dispatcher,
            registry: Arc::downgrade(&registry),
            dead_letters,
            termination_hook,
            supervisor,
        })
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Approximate number of queued user messages. Diagnostic; may be
    /// stale the moment it returns.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the children this cell currently supervises, as recorded
    /// by `Supervise` and trimmed by `ChildTerminated`.
    pub fn children(&self) -> Vec<ActorId> {
        self.cell.lock().children.clone()
    }

    // ── Status word ─────────────────────────────────────────────────────

    // The status word and the queued counter run at SeqCst. The
    // idle/recheck wakeup handshake is a store-buffering pattern
    // (worker: clear Scheduled, then read the queues; producer: publish
    // to a queue, then read Scheduled) and needs a total order across
    // the two locations; acquire/release alone lets both sides read
    // stale values and strand a delivered message.

    fn status(&self) -> usize {
        self.status.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.status() & CLOSED != 0
    }

    pub fn is_scheduled(&self) -> bool {
        self.status() & SCHEDULED != 0
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count() > 0
    }

    pub fn suspend_count(&self) -> usize {
        self.status() / SUSPEND_UNIT
    }

    fn should_process_message(&self) -> bool {
        self.status() & !SCHEDULED == 0
    }

    /// Claim the Scheduled bit. Fails if the mailbox is closed or a
    /// worker already holds the claim.
    pub(crate) fn set_as_scheduled(&self) -> bool {
        loop {
            let s = self.status();
            if s & SHOULD_SCHEDULE_MASK != 0 {
                return false;
            }
            if self
                .status
                .compare_exchange_weak(s, s | SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release the Scheduled bit after a run.
    pub(crate) fn set_as_idle(&self) {
        self.status.fetch_and(!SCHEDULED, Ordering::SeqCst);
    }

    fn suspend_status(&self) {
        loop {
            let s = self.status();
            if s & CLOSED != 0 {
                return;
            }
            if self
                .status
                .compare_exchange_weak(s, s + SUSPEND_UNIT, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    fn resume_status(&self) {
        loop {
            let s = self.status();
            if s & CLOSED != 0 || s < SUSPEND_UNIT {
                return;
            }
            if self
                .status
                .compare_exchange_weak(s, s - SUSPEND_UNIT, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Terminal transition. Returns `false` if the mailbox was already
    /// closed, so close-side effects run exactly once. The caller's
    /// Scheduled claim survives the transition: clearing it here would
    /// let `drain_closed` hand the queue to a second consumer while the
    /// terminal drain is still running.
    fn become_closed(&self) -> bool {
        loop {
            let s = self.status();
            if s & CLOSED != 0 {
                return false;
            }
            if self
                .status
                .compare_exchange_weak(
                    s,
                    CLOSED | (s & SCHEDULED),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Whether a dispatch attempt is worthwhile. Hints let enqueuers skip
    /// re-deriving what they just did; suspended mailboxes only schedule
    /// for system work.
    pub(crate) fn can_be_scheduled(&self, has_message_hint: bool, has_system_hint: bool) -> bool {
        let s = self.status();
        if s & CLOSED != 0 {
            return false;
        }
        if s / SUSPEND_UNIT > 0 {
            has_system_hint || !self.system.is_empty()
        } else {
            has_message_hint || has_system_hint || self.has_pending()
        }
    }

    /// Cross-thread "anything waiting?" check. Uses the queued counter
    /// instead of `NodeQueue::is_empty` because the latter is a
    /// consumer-only operation.
    pub(crate) fn has_pending(&self) -> bool {
        !self.system.is_empty() || self.queued.load(Ordering::SeqCst) > 0
    }

    // ── Producer side ───────────────────────────────────────────────────

    /// Enqueue a user envelope and request dispatch. Closed mailboxes
    /// divert to dead letters; full bounded mailboxes hand the envelope
    /// back.
    pub fn enqueue_user(self: &Arc<Self>, envelope: Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            self.dead_letters.dead_letter(self.id, envelope);
            return Err(SendError::Closed);
        }
        if let Some(capacity) = self.capacity {
            // Add first, roll back on rejection, so racing producers
            // can never overshoot the bound.
            if self.queued.fetch_add(1, Ordering::SeqCst) >= capacity {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(SendError::Full(envelope));
            }
        } else {
            self.queued.fetch_add(1, Ordering::SeqCst);
        }
        self.queue.enqueue(envelope);
        if self.is_closed() {
            // Terminate won the race between the closed check above and
            // the enqueue; make sure the terminal drain did not miss us.
            self.drain_closed();
            return Err(SendError::Closed);
        }
        self.request_dispatch(true, false);
        Ok(())
    }

    /// Enqueue a control signal and request dispatch. System messages
    /// bypass both suspension and capacity.
    pub fn enqueue_system(self: &Arc<Self>, message: SystemMessage) {
        if self.is_closed() {
            self.divert_system(message);
            return;
        }
        self.system.push(message);
        self.request_dispatch(false, true);
    }

    /// A control signal has nowhere to go: the mailbox is closed. A
    /// repeated Terminate is routine; anything else is surfaced through
    /// the dead-letter sink so a lost Watch or Failed is observable.
    fn divert_system(&self, message: SystemMessage) {
        if matches!(message, SystemMessage::Terminate) {
            tracing::debug!(actor = %self.id, "Terminate for already-closed mailbox");
        } else {
            self.dead_letters.dead_system(self.id, message);
        }
    }

    fn request_dispatch(self: &Arc<Self>, has_message_hint: bool, has_system_hint: bool) {
        if let Err(err) =
            self.dispatcher
                .register_for_execution(self, has_message_hint, has_system_hint)
        {
            // The message stays queued; the mailbox is eligible for a
            // later dispatch attempt.
            tracing::debug!(actor = %self.id, %err, "could not schedule mailbox");
        }
    }

    // ── Consumer side ───────────────────────────────────────────────────

    /// One processing run. Caller must hold the Scheduled claim; the
    /// dispatcher releases it and re-registers afterwards.
    pub(crate) fn run(self: &Arc<Self>, throughput: usize) {
        self.process_all_system_messages();
        if self.should_process_message() {
            self.process_user_messages(throughput);
        }
    }

    /// Sweep the system chain, reverse it into delivery order, and drain
    /// it, repeatedly, since processing can race with new arrivals.
    fn process_all_system_messages(self: &Arc<Self>) {
        loop {
            let mut list = self.system.sweep().reverse();
            if list.is_empty() {
                return;
            }
            while let Some(message) = list.pop() {
                if self.is_closed() {
                    // Terminated mid-drain; surface the remainder.
                    self.divert_system(message);
                    continue;
                }
                self.system_invoke(message);
            }
            if self.is_closed() || self.system.is_empty() {
                return;
            }
        }
    }

    fn system_invoke(self: &Arc<Self>, message: SystemMessage) {
        tracing::trace!(actor = %self.id, ?message, "processing control signal");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.apply_system(message)));
        if let Err(payload) = outcome {
            // A fault inside control-signal processing is fatal to this
            // actor, but must not take the worker thread down with it.
            tracing::error!(
                actor = %self.id,
                cause = %panic_message(&*payload),
                "failure while processing control signal; stopping actor"
            );
            self.terminate_now();
        }
    }

    fn apply_system(self: &Arc<Self>, message: SystemMessage) {
        match message {
            SystemMessage::Create => {
                self.cell.lock().actor.pre_start();
            }
            SystemMessage::Recreate { cause } => {
                self.cell.lock().actor.pre_restart(&cause);
                // The restart lifts the suspension its failure caused.
                self.resume_status();
            }
            SystemMessage::Suspend => self.suspend_status(),
            SystemMessage::Resume { .. } => self.resume_status(),
            SystemMessage::Terminate => self.terminate_now(),
            SystemMessage::Supervise { child, .. } => {
                let mut cell = self.cell.lock();
                if !cell.children.contains(&child) {
                    cell.children.push(child);
                }
            }
            SystemMessage::ChildTerminated { child } => {
                self.cell.lock().children.retain(|c| *c != child);
            }
            SystemMessage::Watch { watchee, watcher } => {
                debug_assert_eq!(watchee, self.id, "Watch delivered to the wrong mailbox");
                let mut cell = self.cell.lock();
                if !cell.watchers.contains(&watcher) {
                    cell.watchers.push(watcher);
                }
            }
            SystemMessage::Unwatch { watchee, watcher } => {
                debug_assert_eq!(watchee, self.id, "Unwatch delivered to the wrong mailbox");
                self.cell.lock().watchers.retain(|w| *w != watcher);
            }
            SystemMessage::NoMessage => {}
            SystemMessage::Failed { child, cause, uid } => {
                let directive = self.cell.lock().actor.supervise(child, &cause, uid);
                tracing::debug!(
                    supervisor = %self.id,
                    child = %child,
                    uid,
                    ?directive,
                    "supervision directive"
                );
                match self.registry.upgrade().and_then(|r| r.resolve(child)) {
                    Some(mb) => match directive {
                        Directive::Resume => mb.enqueue_system(SystemMessage::Resume {
                            caused_by_failure: true,
                        }),
                        Directive::Restart => {
                            mb.enqueue_system(SystemMessage::Recreate { cause });
                        }
                        Directive::Stop => mb.enqueue_system(SystemMessage::Terminate),
                    },
                    None => {
                        tracing::debug!(child = %child, "failed child no longer registered");
                    }
                }
            }
        }
    }

    /// Dequeue and invoke up to `throughput` user envelopes, yielding the
    /// worker afterwards. System messages arriving mid-batch preempt the
    /// remainder of the batch.
    fn process_user_messages(self: &Arc<Self>, throughput: usize) {
        let mut left = throughput.max(1);
        while self.should_process_message() {
            let Some(envelope) = self.queue.dequeue() else {
                break;
            };
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.invoke(envelope);
            if !self.system.is_empty() {
                self.process_all_system_messages();
            }
            left -= 1;
            if left == 0 {
                break;
            }
        }
    }

    fn invoke(self: &Arc<Self>, envelope: Envelope) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.cell.lock().actor.receive(envelope)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.handle_failure(err.to_string()),
            Err(payload) => self.handle_failure(panic_message(&*payload)),
        }
    }

    /// Convert a user-code failure into a `Failed` escalation. The failing
    /// actor suspends until its supervisor decides; without a supervisor
    /// there is nobody to resume it, so it logs and keeps running.
    fn handle_failure(self: &Arc<Self>, cause: String) {
        match &self.supervisor {
            Some(supervisor) => {
                tracing::error!(actor = %self.id, %cause, "actor failed; escalating");
                self.suspend_status();
                supervisor.enqueue_system(SystemMessage::Failed {
                    child: self.id,
                    cause,
                    uid: self.uid,
                });
            }
            None => {
                tracing::error!(actor = %self.id, %cause, "actor failed; no supervisor, continuing");
            }
        }
    }

    /// Close the mailbox: drain user messages to dead letters, run
    /// `post_stop`, notify the watch subsystem, unregister, and tell the
    /// supervisor. Runs at most once.
    fn terminate_now(self: &Arc<Self>) {
        if !self.become_closed() {
            return;
        }
        tracing::debug!(actor = %self.id, "terminating");

        // We are the single consumer (our caller holds the Scheduled
        // claim). A producer that raced the closed transition runs
        // `drain_closed` itself after its enqueue, so nothing is left
        // behind for good.
        while let Some(envelope) = self.queue.dequeue() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.dead_letters.dead_letter(self.id, envelope);
        }

        let watchers = {
            let mut cell = self.cell.lock();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cell.actor.post_stop()))
            {
                tracing::error!(
                    actor = %self.id,
                    cause = %panic_message(&*payload),
                    "post_stop panicked"
                );
            }
            std::mem::take(&mut cell.watchers)
        };

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
        self.termination_hook.mailbox_closed(self.id, &watchers);

        if let Some(supervisor) = &self.supervisor {
            supervisor.enqueue_system(SystemMessage::ChildTerminated { child: self.id });
        }
    }

    /// Divert every user envelope left in a closed mailbox to dead
    /// letters. The Scheduled bit doubles as the post-close cleanup
    /// claim, keeping the queue single-consumer: whoever wins the CAS
    /// drains; a loser's holder is either the terminating run (whose
    /// worker calls this again after going idle) or another drainer.
    pub(crate) fn drain_closed(&self) {
        loop {
            if self
                .status
                .compare_exchange(
                    CLOSED,
                    CLOSED | SCHEDULED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                return;
            }
            while let Some(envelope) = self.queue.dequeue() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.dead_letters.dead_letter(self.id, envelope);
            }
            self.status.store(CLOSED, Ordering::SeqCst);
            if self.queued.load(Ordering::SeqCst) == 0 {
                return;
            }
            // A producer slipped in between the drain and the release.
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // Accepted messages are never dropped silently: anything still
        // queued when the last handle goes away is surfaced to the sink.
        while let Some(envelope) = self.queue.dequeue() {
            self.dead_letters.dead_letter(self.id, envelope);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "actor panicked".to_string()
    }
}
