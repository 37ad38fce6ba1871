//! Registry of live connections.
//!
//! Provides lookup by connection id for application code (e.g. pushing a
//! message to another client) and bulk teardown at server shutdown.

use crate::connection::Connection;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// What the manager needs from a connection.
pub trait ManagedConnection: Send + Sync {
    fn conn_id(&self) -> u32;

    /// Tear the connection down; must tolerate repeated calls.
    fn stop(&self);
}

/// Set of live connections keyed by id.
///
/// A connection present in the map is live; `remove` is triggered by the
/// connection's own `stop()`.
pub struct ConnectionManager<C: ManagedConnection = Connection> {
    connections: RwLock<HashMap<u32, Arc<C>>>,
}

impl<C: ManagedConnection> Default for ConnectionManager<C> {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: ManagedConnection> ConnectionManager<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<C>) {
        let conn_id = conn.conn_id();
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        connections.insert(conn_id, conn);
        debug!(conn_id, count = connections.len(), "Connection registered");
    }

    pub fn remove(&self, conn: &C) {
        let conn_id = conn.conn_id();
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.remove(&conn_id).is_some() {
            debug!(conn_id, count = connections.len(), "Connection removed");
        }
    }

    pub fn get(&self, conn_id: u32) -> Result<Arc<C>> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections
            .get(&conn_id)
            .cloned()
            .ok_or(Error::ConnectionNotFound(conn_id))
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every managed connection and empty the set.
    ///
    /// The map is drained before stopping, since `stop()` calls back
    /// into [`remove`](Self::remove).
    pub fn clear_all(&self) {
        let drained: Vec<Arc<C>> = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            connections.drain().map(|(_, conn)| conn).collect()
        };

        let count = drained.len();
        for conn in drained {
            conn.stop();
        }

        info!(count, "Cleared all connections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConn {
        id: u32,
        stops: AtomicUsize,
    }

    impl FakeConn {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                id,
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl ManagedConnection for FakeConn {
        fn conn_id(&self) -> u32 {
            self.id
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_get_remove() {
        let manager = ConnectionManager::new();
        let a = FakeConn::new(1);
        let b = FakeConn::new(2);

        manager.add(Arc::clone(&a));
        manager.add(Arc::clone(&b));
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.get(1).unwrap().conn_id(), 1);

        manager.remove(&a);
        assert_eq!(manager.len(), 1);
        assert!(matches!(manager.get(1), Err(Error::ConnectionNotFound(1))));

        // Removing twice has no further effect
        manager.remove(&a);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_clear_all_stops_each() {
        let manager = ConnectionManager::new();
        let conns: Vec<_> = (0..3).map(FakeConn::new).collect();
        for conn in &conns {
            manager.add(Arc::clone(conn));
        }

        manager.clear_all();

        assert!(manager.is_empty());
        for conn in &conns {
            assert_eq!(conn.stops.load(Ordering::SeqCst), 1);
        }
    }

    /// Mimics `Connection::stop` removing itself from the manager.
    struct SelfRemoving {
        id: u32,
        manager: Arc<ConnectionManager<SelfRemoving>>,
    }

    impl ManagedConnection for SelfRemoving {
        fn conn_id(&self) -> u32 {
            self.id
        }

        fn stop(&self) {
            self.manager.remove(self);
        }
    }

    #[test]
    fn test_clear_all_with_reentrant_stop() {
        let manager = Arc::new(ConnectionManager::new());
        for id in 0..4 {
            manager.add(Arc::new(SelfRemoving {
                id,
                manager: Arc::clone(&manager),
            }));
        }

        manager.clear_all();
        assert_eq!(manager.len(), 0);
    }
}
