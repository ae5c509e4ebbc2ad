// src/dead_letters.rs
//! Sink for messages that cannot be delivered.
//!
//! Closed or unknown destinations divert here instead of silently
//! dropping traffic; control signals that arrive after a mailbox closed
//! are surfaced the same way. The default sink logs; tests and demos
//! use the collecting sink to assert on what was diverted.

use parking_lot::Mutex;

use crate::system::SystemMessage;
use crate::{ActorId, Envelope};

pub trait DeadLetterSink: Send + Sync {
    fn dead_letter(&self, recipient: ActorId, envelope: Envelope);

    /// A control signal addressed to a closed mailbox. The default
    /// records it in the log so a lost `Watch` or `Failed` is visible.
    fn dead_system(&self, recipient: ActorId, message: SystemMessage) {
        tracing::warn!(
            recipient = %recipient,
            ?message,
            "control signal routed to dead letters"
        );
    }
}

/// Default sink: records the diversion in the log and drops the payload.
pub struct LogDeadLetters;

impl DeadLetterSink for LogDeadLetters {
    fn dead_letter(&self, recipient: ActorId, envelope: Envelope) {
        tracing::warn!(
            recipient = %recipient,
            sender = ?envelope.sender,
            bytes = envelope.payload.len(),
            "message routed to dead letters"
        );
    }
}

/// Sink that keeps every diverted message for later inspection.
#[derive(Default)]
pub struct CollectingDeadLetters {
    letters: Mutex<Vec<(ActorId, Envelope)>>,
    signals: Mutex<Vec<(ActorId, SystemMessage)>>,
}

impl CollectingDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }

    /// Remove and return every envelope collected so far.
    pub fn take(&self) -> Vec<(ActorId, Envelope)> {
        std::mem::take(&mut self.letters.lock())
    }

    /// Remove and return every diverted control signal.
    pub fn take_signals(&self) -> Vec<(ActorId, SystemMessage)> {
        std::mem::take(&mut self.signals.lock())
    }
}

impl DeadLetterSink for CollectingDeadLetters {
    fn dead_letter(&self, recipient: ActorId, envelope: Envelope) {
        self.letters.lock().push((recipient, envelope));
    }

    fn dead_system(&self, recipient: ActorId, message: SystemMessage) {
        self.signals.lock().push((recipient, message));
    }
}
