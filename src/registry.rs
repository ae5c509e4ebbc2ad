// src/registry.rs
//! Actor registry: resolves ids to live mailboxes.
//!
//! Registration happens at spawn; a mailbox unregisters itself when it
//! closes, after which sends through the registry divert to dead letters.
//! Supervision directives and the watch subsystem use `resolve` to turn
//! the ids carried in system messages back into mailbox handles.

use std::sync::Arc;

use dashmap::DashMap;

use crate::mailbox::Mailbox;
use crate::ActorId;

pub struct ActorRegistry {
    actors: DashMap<ActorId, Arc<Mailbox>>,
}

impl ActorRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            actors: DashMap::new(),
        }
    }

    /// Register a mailbox under its own id.
    /// An existing entry for the id is overwritten.
    pub fn register(&self, mailbox: Arc<Mailbox>) {
        self.actors.insert(mailbox.id(), mailbox);
    }

    /// Retrieve the mailbox associated with an id.
    pub fn resolve(&self, id: ActorId) -> Option<Arc<Mailbox>> {
        self.actors.get(&id).map(|mb| mb.clone())
    }

    /// Remove an id mapping.
    pub fn unregister(&self, id: ActorId) {
        self.actors.remove(&id);
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
