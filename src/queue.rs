// src/queue.rs
//! Lock-free multi-producer / single-consumer queue for user messages.
//!
//! Producers linearize through an atomic exchange of the tail insertion
//! point and then publish the predecessor's `next` link with a release
//! store; the exchange order *is* the queue order. The single consumer
//! advances a sentinel head pointer. On dequeue the payload is moved out
//! of the node and the node itself stays live as the new sentinel, so
//! payload reclamation is independent of node reclamation.
//!
//! `dequeue`, `peek`, `is_empty` and `count` must only be called from the
//! current consumer context (one thread at a time, not necessarily the
//! same thread across calls). Violating that is a data race, not a
//! reported error; the dispatcher's mutual-exclusion guarantee is what
//! makes these calls safe (see `dispatcher.rs`).

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Intrusive MPSC linked queue. Always contains at least a sentinel node,
/// so `head` and `tail` are never null.
pub struct NodeQueue<T> {
    /// Producer-visible insertion point: the most recently appended node.
    tail: AtomicPtr<Node<T>>,
    /// Consumer-side sentinel cursor. Only the single consumer follows
    /// it, but the consumer may change threads between processing runs,
    /// so the handoff uses release/acquire ordering instead of a plain
    /// field.
    head: AtomicPtr<Node<T>>,
}

// SAFETY: Producers only touch `tail` and a freshly exchanged
// predecessor's `next`; the consumer side is externally serialized.
unsafe impl<T: Send> Send for NodeQueue<T> {}
unsafe impl<T: Send> Sync for NodeQueue<T> {}

impl<T> NodeQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::boxed(None);
        Self {
            tail: AtomicPtr::new(sentinel),
            head: AtomicPtr::new(sentinel),
        }
    }

    /// Append a value. Never blocks, never fails; safe for any number of
    /// concurrent producers.
    pub fn enqueue(&self, value: T) {
        let node = Node::boxed(Some(value));
        // Claim the insertion point first, then link the predecessor.
        // Between the two steps the chain has a gap; the consumer stops
        // at the unpublished link and picks the value up on a later run.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` is the sentinel or a previously enqueued node.
        // Nodes are only retired after the consumer advances past them,
        // and it cannot advance past `prev` until this store publishes
        // the link, so `prev` is still live here.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Remove and return the oldest value, or `None` if no published
    /// value is visible. Consumer-only.
    pub fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: `head` always points at the live sentinel.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // SAFETY: `next` was fully initialized before the release store
        // in `enqueue` made it reachable. Taking the value nulls the
        // node's payload slot; the node lives on as the new sentinel.
        let value = unsafe { (*next).value.take() };
        self.head.store(next, Ordering::Release);
        // SAFETY: the old sentinel's link is published (we just followed
        // it) so no producer still holds it as an insertion point, and
        // the consumer has moved past it. Exclusive ownership.
        drop(unsafe { Box::from_raw(head) });
        value
    }

    /// Clone the oldest value without removing it. Consumer-only.
    /// Returns an owned copy: a borrow into the node's payload slot
    /// would dangle the moment `dequeue` moves the payload out.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: `head` is the live sentinel; see `dequeue`.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            None
        } else {
            // SAFETY: published node, not retired while we are the consumer.
            unsafe { (*next).value.clone() }
        }
    }

    /// `true` when no published value is visible. Consumer-only.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: `head` is the live sentinel.
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// Full O(n) traversal. Diagnostic only: the result can be stale
    /// before this returns and carries no correctness weight under
    /// concurrent enqueues. Consumer-only.
    pub fn count(&self) -> usize {
        let mut n = 0;
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: traversal follows only published links from the live
        // sentinel; nodes ahead of the consumer are not retired.
        let mut cur = unsafe { (*head).next.load(Ordering::Acquire) };
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next.load(Ordering::Acquire) };
        }
        n
    }
}

impl<T> Default for NodeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for NodeQueue<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: `drop` has exclusive access; every node in the
            // chain was allocated by `Node::boxed`.
            let mut node = unsafe { Box::from_raw(cur) };
            cur = *node.next.get_mut();
        }
    }
}
