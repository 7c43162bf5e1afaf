//! User → connection bookkeeping.
//!
//! Two maps: connection ID → [`Connection`], and user ID → that user's set
//! of connection IDs. Every mutation for a user runs under that user's slot
//! lock, so add/remove races for one user serialize while other users
//! proceed independently. Lock order is always user slot, then connection
//! shard.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{ConnectionId, RegistryError, UserId};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::transport::Transport;

#[derive(Default)]
struct UserSlot {
    connections: HashSet<ConnectionId>,
    /// Set when the slot was emptied and unlinked from `users`. A retired
    /// slot must not receive new connections.
    retired: bool,
}

/// Registry of live connections, indexed by ID and by owning user.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    users: DashMap<UserId, Arc<Mutex<UserSlot>>>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry whose connections get `queue_capacity`
    /// outbound slots each.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection for `user_id` and start its writer task.
    ///
    /// Fails with `AlreadyExists` if `connection_id` is tracked for any user.
    /// Must be called from within a Tokio runtime.
    pub fn add(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Connection>, RegistryError> {
        loop {
            let slot = Arc::clone(self.users.entry(user_id.clone()).or_default().value());
            let mut guard = slot.lock();
            if guard.retired {
                // Lost a race with the last removal for this user; the slot
                // was unlinked after we fetched it.
                continue;
            }

            match self.connections.entry(connection_id.clone()) {
                Entry::Occupied(_) => {}
                Entry::Vacant(vacant) => {
                    let connection = Connection::open(
                        connection_id.clone(),
                        user_id.clone(),
                        transport,
                        self.queue_capacity,
                    );
                    let _ = vacant.insert(Arc::clone(&connection));
                    let _ = guard.connections.insert(connection_id.clone());
                    drop(guard);

                    counter!(WS_CONNECTIONS_TOTAL).increment(1);
                    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
                    info!(user_id = %user_id, conn_id = %connection_id, "connection registered");
                    return Ok(connection);
                }
            }

            // Do not leave an empty slot behind for a user we just created.
            if guard.connections.is_empty() {
                guard.retired = true;
                let _ = self
                    .users
                    .remove_if(&user_id, |_, current| Arc::ptr_eq(current, &slot));
            }
            return Err(RegistryError::AlreadyExists(connection_id));
        }
    }

    /// Remove a connection from both the connection table and its user's set.
    ///
    /// Returns the removed record; the caller decides how to close it. A
    /// second removal of the same ID returns `ConnectionNotFound`.
    pub fn remove(&self, connection_id: &ConnectionId) -> Result<Arc<Connection>, RegistryError> {
        let not_found = || RegistryError::ConnectionNotFound(connection_id.clone());

        let user_id = self
            .connections
            .get(connection_id)
            .map(|c| c.user_id().clone())
            .ok_or_else(not_found)?;
        let slot = self
            .users
            .get(&user_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(not_found)?;

        let mut guard = slot.lock();
        let (_, connection) = self
            .connections
            .remove_if(connection_id, |_, c| c.user_id() == &user_id)
            .ok_or_else(not_found)?;
        let _ = guard.connections.remove(connection_id);
        if guard.connections.is_empty() {
            guard.retired = true;
            let _ = self
                .users
                .remove_if(&user_id, |_, current| Arc::ptr_eq(current, &slot));
        }
        drop(guard);

        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        debug!(user_id = %user_id, conn_id = %connection_id, "connection removed");
        Ok(connection)
    }

    /// Snapshot of a user's connection IDs.
    pub fn connections_for_user(&self, user_id: &UserId) -> HashSet<ConnectionId> {
        // Release the shard guard before taking the slot lock.
        let Some(slot) = self.users.get(user_id).map(|s| Arc::clone(s.value())) else {
            return HashSet::new();
        };
        let guard = slot.lock();
        guard.connections.clone()
    }

    /// A user's connections that still accept events.
    pub fn open_connections(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.connections_for_user(user_id)
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|c| c.is_open())
            .collect()
    }

    /// Look up a connection.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of every registered connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    /// Users with at least one registered connection.
    pub fn users(&self) -> Vec<UserId> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// Registered connection count.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Users with at least one registered connection.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("users", &self.users.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingTransport;
    use assert_matches::assert_matches;

    fn transport() -> Box<dyn Transport> {
        Box::new(RecordingTransport::new().0)
    }

    #[tokio::test]
    async fn add_and_get() {
        let registry = ConnectionRegistry::new(8);
        let conn = registry.add("u1".into(), "c1".into(), transport()).unwrap();
        assert_eq!(conn.user_id().as_str(), "u1");
        assert!(registry.get(&"c1".into()).is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.user_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_rejected_even_for_other_user() {
        let registry = ConnectionRegistry::new(8);
        let _ = registry.add("u1".into(), "c1".into(), transport()).unwrap();
        assert_matches!(
            registry.add("u2".into(), "c1".into(), transport()),
            Err(RegistryError::AlreadyExists(id)) if id.as_str() == "c1"
        );
        assert!(registry.connections_for_user(&"u2".into()).is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.user_count(), 1);
    }

    #[tokio::test]
    async fn remove_twice_returns_not_found() {
        let registry = ConnectionRegistry::new(8);
        let _ = registry.add("u1".into(), "c1".into(), transport()).unwrap();

        let removed = registry.remove(&"c1".into()).unwrap();
        assert_eq!(removed.id().as_str(), "c1");
        assert_matches!(
            registry.remove(&"c1".into()),
            Err(RegistryError::ConnectionNotFound(_))
        );
        assert!(registry.is_empty());
        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn multiple_connections_per_user() {
        let registry = ConnectionRegistry::new(8);
        let _ = registry.add("u1".into(), "c1".into(), transport()).unwrap();
        let _ = registry.add("u1".into(), "c2".into(), transport()).unwrap();
        let _ = registry.add("u2".into(), "c3".into(), transport()).unwrap();

        let u1 = registry.connections_for_user(&"u1".into());
        assert_eq!(u1.len(), 2);
        assert!(!u1.contains(&ConnectionId::from("c3")));

        let _ = registry.remove(&"c1".into()).unwrap();
        assert_eq!(registry.connections_for_user(&"u1".into()).len(), 1);
        assert_eq!(registry.user_count(), 2);
    }

    #[tokio::test]
    async fn open_connections_skips_closed() {
        let registry = ConnectionRegistry::new(8);
        let c1 = registry.add("u1".into(), "c1".into(), transport()).unwrap();
        let _ = registry.add("u1".into(), "c2".into(), transport()).unwrap();
        let _ = c1.close(relay_core::CloseReason::ClientClosed);

        let open = registry.open_connections(&"u1".into());
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id().as_str(), "c2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_add_remove_keeps_maps_consistent() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let mut tasks = Vec::new();
        for t in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let id = ConnectionId::from(format!("c{t}_{i}"));
                    let _ = registry
                        .add("shared".into(), id.clone(), transport())
                        .unwrap();
                    if i % 2 == 0 {
                        let _ = registry.remove(&id).unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let ids = registry.connections_for_user(&"shared".into());
        assert_eq!(ids.len(), 8 * 25);
        assert_eq!(registry.len(), ids.len());
        for id in &ids {
            assert!(registry.get(id).is_some());
        }
    }
}
