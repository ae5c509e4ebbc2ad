// src/dispatcher.rs
//! Shared execution service that runs mailboxes on a worker thread pool.
//!
//! The dispatcher owns the only threads in the engine. Mailboxes are
//! submitted through a crossbeam channel after a successful Scheduled
//! claim (`Mailbox::set_as_scheduled`), which is what guarantees that one
//! mailbox never runs on two workers at once. After each run the worker
//! releases the claim and re-registers the mailbox if work remains, the
//! recheck that closes the lost-wakeup window for producers who enqueued
//! while the run was in flight.
//!
//! No actor owns a thread: a run processes at most `throughput` user
//! messages and returns, so one busy mailbox cannot starve the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as cb_channel;
use parking_lot::Mutex;
use thiserror::Error;

use crate::mailbox::Mailbox;

/// Workers recheck the shutdown flag at this interval while parked.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The pool no longer accepts submissions. The mailbox keeps its
    /// messages and stays eligible for a later dispatch attempt.
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Worker threads in the pool. Zero means no threads are spawned and
    /// mailboxes must be driven manually (used by deterministic tests).
    pub workers: usize,
    /// Maximum user messages one mailbox run processes before yielding
    /// its worker back to the pool.
    pub throughput: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            throughput: 32,
        }
    }
}

struct Inner {
    sender: cb_channel::Sender<Arc<Mailbox>>,
    /// Kept so the channel never disconnects and `shutdown` can drain
    /// submissions the workers no longer pick up.
    receiver: cb_channel::Receiver<Arc<Mailbox>>,
    shutdown: AtomicBool,
    throughput: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn register(
        self: &Arc<Self>,
        mailbox: &Arc<Mailbox>,
        has_message_hint: bool,
        has_system_hint: bool,
    ) -> Result<bool, DispatchError> {
        if !mailbox.can_be_scheduled(has_message_hint, has_system_hint) {
            return Ok(false);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }
        if !mailbox.set_as_scheduled() {
            // Another thread holds the claim; its post-run recheck will
            // see the new work.
            return Ok(false);
        }
        match self.sender.send(mailbox.clone()) {
            Ok(()) => Ok(true),
            Err(_) => {
                mailbox.set_as_idle();
                Err(DispatchError::ShuttingDown)
            }
        }
    }

    fn run_mailbox(self: &Arc<Self>, mailbox: &Arc<Mailbox>) {
        mailbox.run(self.throughput);
        mailbox.set_as_idle();
        if mailbox.is_closed() {
            // A straggler may have landed behind the terminal drain
            // while this run still held the claim.
            mailbox.drain_closed();
        } else if mailbox.has_pending() {
            if let Err(err) = self.register(mailbox, false, false) {
                tracing::debug!(actor = %mailbox.id(), %err, "re-registration rejected");
            }
        }
    }

    fn worker_loop(self: Arc<Self>, rx: cb_channel::Receiver<Arc<Mailbox>>, idx: usize) {
        let span = tracing::debug_span!("worker", idx);
        let _guard = span.enter();
        tracing::debug!("worker started");
        loop {
            match rx.recv_timeout(PARK_TIMEOUT) {
                Ok(mailbox) => self.run_mailbox(&mailbox),
                Err(cb_channel::RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        // Registration is refused once the flag is up, so
                        // this drain empties the channel for good.
                        while let Ok(mailbox) = rx.try_recv() {
                            self.run_mailbox(&mailbox);
                        }
                        break;
                    }
                }
                Err(cb_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("worker stopped");
    }
}

/// Cheap cloneable handle to the shared pool.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let (tx, rx) = cb_channel::unbounded::<Arc<Mailbox>>();
        let inner = Arc::new(Inner {
            sender: tx,
            receiver: rx.clone(),
            shutdown: AtomicBool::new(false),
            throughput: config.throughput,
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let inner = inner.clone();
            let rx = rx.clone();
            handles.push(thread::spawn(move || inner.worker_loop(rx, idx)));
        }
        *inner.workers.lock() = handles;

        tracing::debug!(workers = config.workers, throughput = config.throughput, "dispatcher started");
        Self { inner }
    }

    /// Submit a mailbox for a processing run, claiming its Scheduled bit
    /// first. Returns `Ok(false)` when no run is needed (nothing pending,
    /// closed, or already claimed) and `Ok(true)` on submission.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ShuttingDown`] when the pool refuses the
    /// submission; already-enqueued messages are retained.
    pub fn register_for_execution(
        &self,
        mailbox: &Arc<Mailbox>,
        has_message_hint: bool,
        has_system_hint: bool,
    ) -> Result<bool, DispatchError> {
        self.inner
            .register(mailbox, has_message_hint, has_system_hint)
    }

    /// Configured per-run user-message batch limit.
    pub fn throughput(&self) -> usize {
        self.inner.throughput
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting submissions, let workers drain in-flight runs, and
    /// join them. Idempotent; a second caller returns immediately (and
    /// may return before the first caller finishes joining). Must not be
    /// called from a worker thread.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        // Submissions that raced the flag were never run; release their
        // claims so the mailboxes stay eligible for a future dispatcher.
        while let Ok(mailbox) = self.inner.receiver.try_recv() {
            mailbox.set_as_idle();
        }
        tracing::debug!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letters::CollectingDeadLetters;
    use crate::mailbox::{LogTermination, MailboxOptions};
    use crate::registry::ActorRegistry;
    use crate::{Actor, ActorError, ActorId, Envelope};
    use bytes::Bytes;
    use parking_lot::Mutex as PlMutex;
    use std::time::Instant;

    struct Recorder {
        seen: Arc<PlMutex<Vec<Bytes>>>,
    }

    impl Actor for Recorder {
        fn receive(&mut self, envelope: Envelope) -> Result<(), ActorError> {
            self.seen.lock().push(envelope.payload);
            Ok(())
        }
    }

    fn spawn_mailbox(dispatcher: &Dispatcher) -> (Arc<Mailbox>, Arc<PlMutex<Vec<Bytes>>>) {
        let registry = Arc::new(ActorRegistry::new());
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let mailbox = Mailbox::new(
            ActorId(1),
            1,
            Box::new(Recorder { seen: seen.clone() }),
            MailboxOptions::default(),
            dispatcher.clone(),
            registry.clone(),
            Arc::new(CollectingDeadLetters::new()),
            Arc::new(LogTermination),
            None,
        );
        registry.register(mailbox.clone());
        (mailbox, seen)
    }

    fn wait_until(mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn workers_process_enqueued_messages() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: 2,
            throughput: 8,
        });
        let (mailbox, seen) = spawn_mailbox(&dispatcher);
        for i in 0..50u8 {
            mailbox
                .enqueue_user(Envelope {
                    sender: None,
                    payload: Bytes::copy_from_slice(&[i]),
                })
                .unwrap();
        }
        wait_until(|| seen.lock().len() == 50);
        // One producer: delivery preserves enqueue order.
        let seen = seen.lock();
        for (i, payload) in seen.iter().enumerate() {
            assert_eq!(payload.as_ref(), &[i as u8]);
        }
        dispatcher.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: 2,
            throughput: 8,
        });
        dispatcher.shutdown();
        dispatcher.shutdown();
        assert!(dispatcher.is_shutdown());
    }

    #[test]
    fn rejected_dispatch_loses_no_messages() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: 1,
            throughput: 8,
        });
        let (mailbox, seen) = spawn_mailbox(&dispatcher);
        dispatcher.shutdown();

        // The mailbox still accepts the message; only scheduling fails.
        mailbox
            .enqueue_user(Envelope {
                sender: None,
                payload: Bytes::from_static(b"kept"),
            })
            .unwrap();
        assert_eq!(mailbox.len(), 1);
        assert!(seen.lock().is_empty());
        assert!(!mailbox.is_scheduled(), "claim must be released on rejection");

        let err = dispatcher
            .register_for_execution(&mailbox, true, false)
            .unwrap_err();
        assert_eq!(err, DispatchError::ShuttingDown);
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn zero_workers_means_manual_drive() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers: 0,
            throughput: 8,
        });
        let (mailbox, seen) = spawn_mailbox(&dispatcher);
        mailbox
            .enqueue_user(Envelope {
                sender: None,
                payload: Bytes::from_static(b"manual"),
            })
            .unwrap();
        assert!(seen.lock().is_empty());
        mailbox.run(8);
        mailbox.set_as_idle();
        assert_eq!(seen.lock().len(), 1);
    }
}
