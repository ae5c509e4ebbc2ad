// src/system.rs
//! System messages and the intrusive lists that carry them.
//!
//! Control signals travel on a separate channel from user messages and
//! always win priority. Producers prepend onto a shared latest-first
//! chain with a CAS retry loop (O(1), minimal contention); the consumer
//! atomically sweeps the whole chain and reverses it into earliest-first
//! order before draining, which is what gives system messages FIFO
//! delivery per mailbox.
//!
//! The two list types tag the same node representation with its traversal
//! order. `reverse` consumes its input by move, so "a reversed chain must
//! not be reused through its old handle" is enforced by the type system
//! rather than by convention.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::ActorId;

/// Cause string attached to failure-related control signals.
pub type FailureCause = String;

/// Control-plane signals delivered ahead of user traffic. Each variant is
/// processed exactly once by exactly one mailbox's drain and never
/// retained afterward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemMessage {
    /// First signal an actor processes; runs `pre_start`.
    Create,
    /// Restart after a failure; runs `pre_restart` and lifts the failure
    /// suspension.
    Recreate { cause: FailureCause },
    /// Raise the suspend count; user processing stops until every
    /// `Suspend` is matched by a `Resume`.
    Suspend,
    /// Lower the suspend count.
    Resume { caused_by_failure: bool },
    /// Stop the actor. Once processed the mailbox is closed for good.
    Terminate,
    /// Register `child` with the supervising cell.
    Supervise { child: ActorId, async_registration: bool },
    /// A supervised child's mailbox has closed.
    ChildTerminated { child: ActorId },
    /// Record `watcher` as interested in the watchee's termination.
    Watch { watchee: ActorId, watcher: ActorId },
    /// Remove a previously recorded watcher.
    Unwatch { watchee: ActorId, watcher: ActorId },
    /// Inert end-of-chain marker. The runtime never fabricates one;
    /// draining it is a no-op.
    NoMessage,
    /// Escalation from a failed child to its supervisor, the only
    /// channel crash information crosses mailbox boundaries on.
    Failed {
        child: ActorId,
        cause: FailureCause,
        uid: u64,
    },
}

/// One chain node. The `next` pointer is storage owned by whichever list
/// the entry is currently linked into; an entry is never a member of two
/// chains at once.
struct Entry {
    msg: SystemMessage,
    next: *mut Entry,
}

/// Walk a chain, freeing every entry.
fn free_chain(mut head: *mut Entry) {
    while !head.is_null() {
        // SAFETY: chains are built exclusively from `Box::into_raw`
        // entries, and the caller owns the whole chain.
        let entry = unsafe { Box::from_raw(head) };
        head = entry.next;
    }
}

/// Reverse a chain in place, returning the new head.
fn reverse_chain(mut head: *mut Entry) -> *mut Entry {
    let mut reversed = ptr::null_mut();
    while !head.is_null() {
        // SAFETY: the caller owns the chain; rewiring `next` cannot race.
        let next = unsafe { (*head).next };
        unsafe { (*head).next = reversed };
        reversed = head;
        head = next;
    }
    reversed
}

fn chain_len(mut head: *const Entry) -> usize {
    let mut n = 0;
    while !head.is_null() {
        n += 1;
        // SAFETY: read-only walk over an owned chain.
        head = unsafe { (*head).next };
    }
    n
}

/// A chain in prepend order: the head is the most recently added message.
/// This is the shape producers build; it must be reversed before draining.
pub struct LatestFirst {
    head: *mut Entry,
}

/// A chain in delivery order: the head is the oldest message. Ready to
/// drain.
pub struct EarliestFirst {
    head: *mut Entry,
}

// SAFETY: each list exclusively owns its chain; entries hold only a
// `SystemMessage` (Send) and an intra-chain pointer.
unsafe impl Send for LatestFirst {}
unsafe impl Send for EarliestFirst {}

impl LatestFirst {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// O(n); diagnostic.
    pub fn size(&self) -> usize {
        chain_len(self.head)
    }

    /// Attach `msg` as the new head. O(1).
    pub fn prepend(&mut self, msg: SystemMessage) {
        self.head = Box::into_raw(Box::new(Entry {
            msg,
            next: self.head,
        }));
    }

    /// Borrow the most recently prepended message.
    pub fn head(&self) -> Option<&SystemMessage> {
        if self.head.is_null() {
            None
        } else {
            // SAFETY: non-null head of an owned chain.
            Some(unsafe { &(*self.head).msg })
        }
    }

    /// Detach and return the head message, leaving the tail. O(1).
    pub fn pop(&mut self) -> Option<SystemMessage> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: we own the chain; the head entry leaves it here.
        let entry = unsafe { Box::from_raw(self.head) };
        self.head = entry.next;
        Some(entry.msg)
    }

    /// All but the most recent message. O(1), consuming; taking the tail
    /// by move is what makes "tail view aliases a mutated head" a
    /// compile error instead of a hazard.
    pub fn tail(mut self) -> Self {
        drop(self.pop());
        self
    }

    /// Destructively reverse into delivery order. Consumes the list; the
    /// old handle cannot be used again.
    pub fn reverse(self) -> EarliestFirst {
        let this = ManuallyDrop::new(self);
        EarliestFirst {
            head: reverse_chain(this.head),
        }
    }

    /// Fold this chain onto the front of `rest`, reversing its order in
    /// the process. O(n) in `self`, consuming it.
    pub fn reverse_prepend(self, rest: EarliestFirst) -> EarliestFirst {
        let mut acc = rest;
        let mut this = ManuallyDrop::new(self);
        let mut head = this.head;
        this.head = ptr::null_mut();
        while !head.is_null() {
            // SAFETY: exclusively owned chain being dismantled node by node.
            let next = unsafe { (*head).next };
            unsafe { (*head).next = acc.head };
            acc.head = head;
            head = next;
        }
        acc
    }
}

impl Default for LatestFirst {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LatestFirst {
    fn drop(&mut self) {
        free_chain(self.head);
    }
}

impl EarliestFirst {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// O(n); diagnostic.
    pub fn size(&self) -> usize {
        chain_len(self.head)
    }

    /// Borrow the oldest message.
    pub fn head(&self) -> Option<&SystemMessage> {
        if self.head.is_null() {
            None
        } else {
            // SAFETY: non-null head of an owned chain.
            Some(unsafe { &(*self.head).msg })
        }
    }

    /// Detach and return the oldest message, leaving the tail. O(1).
    pub fn pop(&mut self) -> Option<SystemMessage> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: we own the chain; the head entry leaves it here.
        let entry = unsafe { Box::from_raw(self.head) };
        self.head = entry.next;
        Some(entry.msg)
    }

    /// All but the oldest message. O(1), consuming.
    pub fn tail(mut self) -> Self {
        drop(self.pop());
        self
    }

    /// Destructively reverse back into prepend order, consuming the list.
    pub fn reverse(self) -> LatestFirst {
        let this = ManuallyDrop::new(self);
        LatestFirst {
            head: reverse_chain(this.head),
        }
    }
}

impl Default for EarliestFirst {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EarliestFirst {
    fn drop(&mut self) {
        free_chain(self.head);
    }
}

/// Shared producer side of a mailbox's system channel: a latest-first
/// chain with an atomic head. Any thread may `push`; `sweep` detaches the
/// whole chain for the single consumer.
pub(crate) struct SystemQueue {
    head: AtomicPtr<Entry>,
}

// SAFETY: the chain behind `head` is only mutated through the atomic CAS
// protocol below; sweeping transfers exclusive ownership to the caller.
unsafe impl Send for SystemQueue {}
unsafe impl Sync for SystemQueue {}

impl SystemQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Prepend a message. CAS retry loop; safe for concurrent producers.
    /// SeqCst on success so the publication is totally ordered against
    /// the mailbox status word in the dispatcher's idle/recheck
    /// handshake.
    pub(crate) fn push(&self, msg: SystemMessage) {
        let entry = Box::into_raw(Box::new(Entry {
            msg,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `entry` is unpublished until the CAS succeeds, so
            // rewriting its `next` on retry cannot race.
            unsafe { (*entry).next = head };
            match self
                .head
                .compare_exchange_weak(head, entry, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Atomically detach the entire chain, newest first. Each pushed
    /// message is returned by exactly one sweep.
    pub(crate) fn sweep(&self) -> LatestFirst {
        LatestFirst {
            head: self.head.swap(ptr::null_mut(), Ordering::SeqCst),
        }
    }

    /// `true` when no message is waiting. Safe from any thread (pointer
    /// load only, no dereference). SeqCst for the same handshake reason
    /// as `push`.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }
}

impl Drop for SystemQueue {
    fn drop(&mut self) {
        free_chain(*self.head.get_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn collect(mut list: EarliestFirst) -> Vec<SystemMessage> {
        let mut out = Vec::new();
        while let Some(msg) = list.pop() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn prepend_then_pop_is_lifo() {
        let mut list = LatestFirst::new();
        list.prepend(SystemMessage::Suspend);
        list.prepend(SystemMessage::Terminate);
        assert_eq!(list.size(), 2);
        assert_eq!(list.head(), Some(&SystemMessage::Terminate));
        assert_eq!(list.pop(), Some(SystemMessage::Terminate));
        assert_eq!(list.pop(), Some(SystemMessage::Suspend));
        assert_eq!(list.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn tail_drops_exactly_the_head() {
        let mut list = LatestFirst::new();
        list.prepend(SystemMessage::Create);
        list.prepend(SystemMessage::Suspend);
        list.prepend(SystemMessage::Terminate);
        let rest = list.tail();
        assert_eq!(rest.size(), 2);
        assert_eq!(rest.head(), Some(&SystemMessage::Suspend));
        assert!(LatestFirst::new().tail().is_empty());
    }

    #[test]
    fn reverse_yields_delivery_order() {
        let mut list = LatestFirst::new();
        list.prepend(SystemMessage::Create);
        list.prepend(SystemMessage::Suspend);
        list.prepend(SystemMessage::Terminate);
        let delivered = collect(list.reverse());
        assert_eq!(
            delivered,
            vec![
                SystemMessage::Create,
                SystemMessage::Suspend,
                SystemMessage::Terminate,
            ]
        );
    }

    #[test]
    fn double_reverse_restores_content_order() {
        let mut list = LatestFirst::new();
        for i in 0..5 {
            list.prepend(SystemMessage::Failed {
                child: ActorId(i),
                cause: "x".into(),
                uid: i,
            });
        }
        let original: Vec<u64> = (0..5).rev().collect();

        let twice = list.reverse().reverse();
        let mut restored = Vec::new();
        let mut cursor = twice;
        while let Some(msg) = cursor.pop() {
            match msg {
                SystemMessage::Failed { uid, .. } => restored.push(uid),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(restored, original);
    }

    #[test]
    fn reverse_prepend_folds_in_front() {
        // rest: [Create, Suspend] in delivery order.
        let mut rest = LatestFirst::new();
        rest.prepend(SystemMessage::Create);
        rest.prepend(SystemMessage::Suspend);
        let rest = rest.reverse();
        // pending: prepended Terminate then NoMessage => latest-first
        // [NoMessage, Terminate]
        let mut pending = LatestFirst::new();
        pending.prepend(SystemMessage::Terminate);
        pending.prepend(SystemMessage::NoMessage);

        let merged = collect(pending.reverse_prepend(rest));
        assert_eq!(
            merged,
            vec![
                SystemMessage::Terminate,
                SystemMessage::NoMessage,
                SystemMessage::Create,
                SystemMessage::Suspend,
            ]
        );
    }

    #[test]
    fn sweep_detaches_everything_once() {
        let q = SystemQueue::new();
        q.push(SystemMessage::Create);
        q.push(SystemMessage::Suspend);
        assert!(!q.is_empty());

        let first = collect(q.sweep().reverse());
        assert_eq!(first, vec![SystemMessage::Create, SystemMessage::Suspend]);
        assert!(q.is_empty());
        assert!(q.sweep().is_empty());
    }

    #[test]
    fn concurrent_pushes_are_not_lost() {
        const PRODUCERS: u64 = 8;
        const PER_PRODUCER: u64 = 500;

        let q = Arc::new(SystemQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push(SystemMessage::Failed {
                            child: ActorId(p),
                            cause: String::new(),
                            uid: p * PER_PRODUCER + i,
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = vec![false; (PRODUCERS * PER_PRODUCER) as usize];
        let mut list = q.sweep().reverse();
        while let Some(msg) = list.pop() {
            if let SystemMessage::Failed { uid, .. } = msg {
                assert!(!seen[uid as usize], "uid {uid} swept twice");
                seen[uid as usize] = true;
            }
        }
        assert!(seen.iter().all(|s| *s), "at least one push was lost");
    }

    #[test]
    fn dropping_a_chain_frees_it() {
        let mut list = LatestFirst::new();
        for _ in 0..100 {
            list.prepend(SystemMessage::NoMessage);
        }
        drop(list); // leak-checked under Miri
    }
}
