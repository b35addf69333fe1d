//! Connection Registry.
//!
//! Tracks every admitted connection and who is speaking through it. Admission
//! and teardown mutate it; broadcasts read a snapshot of it.
//!
//! All operations share one mutex. The guard is held only long enough to
//! insert, remove or clone the entries, never across network I/O, so a slow
//! recipient cannot stall admission or teardown of other connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, instrument};

use crate::connection::Connection;
use crate::types::{ConnectionId, Identity, Participant};

/// Shared table of live connections.
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, Participant>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    // Every mutation is a single insert or remove, so a panic elsewhere
    // cannot leave the map half-updated.
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Participant>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make a connection visible to subsequent broadcasts.
    ///
    /// The caller guarantees a connection is never registered twice
    /// concurrently; a repeat registration replaces the entry.
    #[instrument(skip(self, connection), fields(connection = %connection.id(), identity = %identity))]
    pub fn register(&self, connection: Connection, identity: Identity) {
        let id = connection.id();
        let existing = self
            .lock()
            .insert(id, Participant::new(identity, connection));
        if existing.is_some() {
            debug!("Replaced existing registration");
        } else {
            debug!("Registered connection");
        }
    }

    /// Remove a connection. Absent connections are ignored.
    ///
    /// Returns true if an entry was removed. Teardown and the broadcaster may
    /// both try to remove the same connection; only the first one wins.
    #[instrument(skip(self), fields(connection = %id))]
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Connection was not registered");
        }
        removed.is_some()
    }

    /// Point-in-time copy of every entry, safe to iterate without the lock.
    pub fn snapshot(&self) -> Vec<Participant> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Identities of everyone currently connected, sorted.
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> =
            self.lock().values().map(|p| p.identity.clone()).collect();
        identities.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        identities
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.len())
            .finish()
    }
}
