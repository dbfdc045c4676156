//! Table of live connections.
//!
//! Each connection occupies a slot identified by an index plus a generation.
//! Slots are reused by the slab, generations never are, so an event tagged
//! with an old [`ConnectionId`] is recognized as stale even when its index
//! now belongs to a newer connection.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use slab::Slab;

use crate::transport::TransportKind;

/// Handle naming one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: usize,
    generation: u64,
}

impl ConnectionId {
    /// Slot index.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation stamped at registration.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// What the table knows about a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub peer: String,
}

#[derive(Debug)]
struct Inner {
    slots: Slab<ConnectionInfo>,
    next_generation: u64,
}

/// Registry of live connections, shared by connectors and sessions.
#[derive(Debug)]
pub struct ConnectionTable {
    inner: Mutex<Inner>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Slab::new(),
                next_generation: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The table holds no invariants a panicking holder could break.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a slot for a new connection.
    pub fn register(&self, kind: TransportKind, peer: impl Into<String>) -> ConnectionId {
        let mut inner = self.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let entry = inner.slots.vacant_entry();
        let id = ConnectionId {
            index: entry.key(),
            generation,
        };
        entry.insert(ConnectionInfo {
            id,
            kind,
            peer: peer.into(),
        });
        id
    }

    /// Check that `id` still names a live connection.
    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.lock()
            .slots
            .get(id.index)
            .is_some_and(|info| info.id == id)
    }

    /// Look up a live connection.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock()
            .slots
            .get(id.index)
            .filter(|info| info.id == id)
            .cloned()
    }

    /// Free the slot held by `id`.
    ///
    /// Returns `false` if the slot was already freed or now belongs to a
    /// different generation.
    pub fn release(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        match inner.slots.get(id.index) {
            Some(info) if info.id == id => {
                inner.slots.remove(id.index);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every live connection.
    pub fn live(&self) -> Vec<ConnectionInfo> {
        self.lock().slots.iter().map(|(_, info)| info.clone()).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Check if no connection is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
