//! Connection registry and identity mailboxes.
//!
//! Both maps live behind one mutex so they can only ever change together:
//! a connection is in the registry if and only if it is in exactly one
//! mailbox, and a mailbox exists only while it has at least one member.
//! Critical sections never await and never touch the network.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::connection::ClientConnection;
use super::identity::{ConnectionId, Identity};

#[derive(Default)]
struct Maps {
    /// Connection → claimed identity.
    registry: HashMap<ConnectionId, Identity>,
    /// Identity → connections currently claiming it.
    mailboxes: HashMap<Identity, HashMap<ConnectionId, Arc<ClientConnection>>>,
}

/// Registry + room directory, owned as one unit.
#[derive(Default)]
pub struct RelayDirectory {
    maps: Mutex<Maps>,
}

impl RelayDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `identity`, creating the mailbox if needed.
    ///
    /// Returns `false` (and changes nothing) if the connection is already
    /// registered.
    pub fn register(&self, conn: Arc<ClientConnection>, identity: Identity) -> bool {
        let mut maps = self.maps.lock();
        if maps.registry.contains_key(&conn.id) {
            return false;
        }
        let _ = maps.registry.insert(conn.id.clone(), identity.clone());
        let mailbox = maps.mailboxes.entry(identity).or_default();
        let _ = mailbox.insert(conn.id.clone(), conn);
        true
    }

    /// Remove `conn_id` from the registry and from its mailbox, deleting the
    /// mailbox when it empties. Unknown ids are a no-op.
    pub fn unregister(&self, conn_id: &ConnectionId) -> Option<Identity> {
        let mut maps = self.maps.lock();
        let identity = maps.registry.remove(conn_id)?;
        let emptied = match maps.mailboxes.get_mut(&identity) {
            Some(mailbox) => {
                let _ = mailbox.remove(conn_id);
                mailbox.is_empty()
            }
            None => false,
        };
        if emptied {
            let _ = maps.mailboxes.remove(&identity);
            debug!(identity = %identity, "mailbox removed");
        }
        Some(identity)
    }

    /// Snapshot of the connections currently claiming `identity`.
    pub fn mailbox(&self, identity: &Identity) -> Vec<Arc<ClientConnection>> {
        let maps = self.maps.lock();
        maps.mailboxes
            .get(identity)
            .map(|mailbox| mailbox.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Identity a connection registered under, if any.
    pub fn identity_of(&self, conn_id: &ConnectionId) -> Option<Identity> {
        self.maps.lock().registry.get(conn_id).cloned()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.maps.lock().registry.len()
    }

    /// Number of non-empty mailboxes (distinct online identities).
    pub fn mailbox_count(&self) -> usize {
        self.maps.lock().mailboxes.len()
    }

    /// Check the lock-step and no-empty-mailbox invariants.
    pub fn is_consistent(&self) -> bool {
        let maps = self.maps.lock();
        let members: usize = maps.mailboxes.values().map(HashMap::len).sum();
        members == maps.registry.len()
            && maps.mailboxes.values().all(|mailbox| !mailbox.is_empty())
            && maps.registry.iter().all(|(conn_id, identity)| {
                maps.mailboxes
                    .get(identity)
                    .is_some_and(|mailbox| mailbox.contains_key(conn_id))
            })
    }

    /// Register `conn` and return a guard that unregisters it on drop.
    ///
    /// Returns `None` if the connection is already registered.
    pub fn join(
        self: &Arc<Self>,
        conn: Arc<ClientConnection>,
        identity: Identity,
    ) -> Option<Registration> {
        let conn_id = conn.id.clone();
        self.register(conn, identity.clone())
            .then(|| Registration {
                directory: Arc::clone(self),
                conn_id,
                identity,
            })
    }
}

/// Live registration of one connection.
///
/// Dropping the guard unregisters the connection, whichever way the owning
/// task ends (return, error, abort or panic).
pub struct Registration {
    directory: Arc<RelayDirectory>,
    conn_id: ConnectionId,
    identity: Identity,
}

impl Registration {
    /// The identity this connection claimed.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The registered connection's id.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.conn_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = self.directory.unregister(&self.conn_id);
    }
}
