//! The registry of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionId};
use crate::metrics::MetricsRecorder;

/// Mapping from connection-id to [`Connection`], guarded by a single
/// reader-writer lock. Iteration for fan-out always copies the live
/// connections into a local snapshot under the read lock before doing
/// anything that could block (sending to a push channel, enqueueing),
/// so enqueue never holds the lock across a potential suspension point.
pub struct ConnectionRegistry<P> {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection<P>>>>,
}

impl<P> Default for ConnectionRegistry<P> {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> ConnectionRegistry<P> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `connection`, bumping the per-version client-count metric.
    /// Called once the first-request handshake has initialized the proxy:
    /// a connection-id only appears in the registry between
    /// this call and [`Self::disconnect`].
    pub async fn connect(
        &self,
        connection: Arc<Connection<P>>,
        version: &str,
        metrics: &dyn MetricsRecorder,
    ) {
        let id = connection.id.clone();
        self.connections.write().await.insert(id, connection);
        metrics.client_count(version, 1);
    }

    /// Removes `id`. Logs an internal error if it was already absent:
    /// that would mean a double-disconnect, which should
    /// never happen under the single-writer session-loop discipline.
    pub async fn disconnect(&self, id: &ConnectionId, version: &str, metrics: &dyn MetricsRecorder) {
        let removed = self.connections.write().await.remove(id);
        if removed.is_some() {
            metrics.client_count(version, -1);
        } else {
            metrics.internal_error("disconnect of unknown connection id");
        }
    }

    /// Returns the connection for `id`, if still registered.
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection<P>>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Copies all currently-registered connections into a `Vec` under the
    /// read lock. Used by the push dispatcher before enqueueing, so the
    /// read lock is released before any channel sends happen.
    pub async fn snapshot(&self) -> Vec<Arc<Connection<P>>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// The number of currently-registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether the registry currently holds no connections.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TracingMetrics;
    use crate::proxy::StaticProxy;

    fn conn(id: &str) -> Arc<Connection<StaticProxy>> {
        let (c, _rx) = Connection::new(
            ConnectionId(id.to_string()),
            "127.0.0.1:0".into(),
            vec![],
            StaticProxy::new(id),
        );
        Arc::new(c)
    }

    #[tokio::test]
    async fn connect_then_disconnect_round_trips() {
        let registry = ConnectionRegistry::new();
        let metrics = TracingMetrics;
        let id = ConnectionId("node-1".into());

        registry.connect(conn("node-1"), "v1", &metrics).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&id).await.is_some());

        registry.disconnect(&id, "v1", &metrics).await;
        assert!(registry.is_empty().await);
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn snapshot_reflects_current_membership() {
        let registry = ConnectionRegistry::new();
        let metrics = TracingMetrics;
        registry.connect(conn("a"), "v1", &metrics).await;
        registry.connect(conn("b"), "v1", &metrics).await;

        let snap = registry.snapshot().await;
        assert_eq!(snap.len(), 2);
    }
}
