//! The per-stream [`Connection`] object.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};

use crate::proxy::Event;
use crate::watched::WatchedResource;

/// A (resource name, type-url) pair, used for cache invalidation and
/// incremental-push filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// The resource's name.
    pub name: String,
    /// The type URL the resource belongs to.
    pub type_url: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_url, self.name)
    }
}

/// A globally unique, process-scoped connection identifier:
/// `<node-id>-<monotonic-counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates strictly increasing, process-wide connection-id suffixes.
#[derive(Debug, Default)]
pub struct ConnectionIdAllocator {
    counter: AtomicU64,
}

impl ConnectionIdAllocator {
    /// Creates a fresh allocator starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator whose first allocation yields counter `start + 1`.
    pub fn starting_at(start: u64) -> Self {
        ConnectionIdAllocator {
            counter: AtomicU64::new(start),
        }
    }

    /// Allocates the next id for `node_id`.
    pub fn allocate(&self, node_id: &str) -> ConnectionId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionId(format!("{node_id}-{n}"))
    }
}

/// Per-stream state. Exclusively owned and mutated by its
/// session loop; `watched_resources` is additionally guarded by an RwLock
/// so metrics/debug inspectors can read it without blocking the writer.
#[derive(Debug)]
pub struct Connection<P> {
    /// The connection's process-unique id.
    pub id: ConnectionId,
    /// The peer's network address, if the transport exposed one.
    pub peer_address: String,
    /// Identities extracted from the transport (possibly empty).
    pub identities: Vec<String>,
    /// When the stream was accepted.
    pub connect_time: Instant,
    /// The proxy snapshot this connection has initialized.
    pub proxy: Arc<RwLock<P>>,
    /// Per-type-url subscription state, keyed by type URL.
    pub watched_resources: Arc<RwLock<HashMap<String, WatchedResource>>>,
    /// Sender half of the single-slot push channel; push workers deliver
    /// [`Event`]s here, the session loop is the sole reader.
    pub push_tx: mpsc::Sender<Event>,
}

impl<P> Connection<P> {
    /// Creates a new connection and returns it along with the receiver half
    /// of its single-slot push channel.
    ///
    /// The channel is deliberately capacity-1: back-pressure and merging of
    /// outstanding pushes is the push queue's job, a buffered
    /// channel here would duplicate that responsibility.
    pub fn new(
        id: ConnectionId,
        peer_address: String,
        identities: Vec<String>,
        proxy: P,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (push_tx, push_rx) = mpsc::channel(1);
        let connection = Connection {
            id,
            peer_address,
            identities,
            connect_time: Instant::now(),
            proxy: Arc::new(RwLock::new(proxy)),
            watched_resources: Arc::new(RwLock::new(HashMap::new())),
            push_tx,
        };
        (connection, push_rx)
    }
}
