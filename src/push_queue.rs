//! The shared push queue: merges outstanding
//! [`PushRequest`]s per connection and delivers them through the
//! connection's push channel via a small pool of worker tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};

use crate::connection::ConnectionId;
use crate::metrics::MetricsRecorder;
use crate::proxy::{Event, PushRequest};
use crate::registry::ConnectionRegistry;

/// Enqueues push work for a connection, merging with anything already
/// outstanding for that connection.
pub trait PushQueue: Send + Sync + 'static {
    /// Schedules `request` for `id`. If a request for `id` is already
    /// pending (not yet picked up by a worker), the two are merged rather
    /// than queued separately.
    fn enqueue(&self, id: ConnectionId, request: PushRequest);
}

fn merge(existing: PushRequest, incoming: PushRequest) -> PushRequest {
    let mut configs_updated = existing.configs_updated;
    configs_updated.extend(incoming.configs_updated);
    let mut reason = existing.reason;
    reason.extend(incoming.reason);
    PushRequest {
        full: existing.full || incoming.full,
        push_context: incoming.push_context,
        configs_updated,
        start: existing.start,
        reason,
    }
}

/// A bounded-worker [`PushQueue`]: a handful of background tasks drain a
/// per-connection pending map and deliver merged events through each
/// connection's single-slot push channel, keeping back-pressure in the
/// queue rather than in the channel itself.
pub struct MergingPushQueue<P> {
    registry: Arc<ConnectionRegistry<P>>,
    pending: Mutex<HashMap<ConnectionId, PushRequest>>,
    notify: Notify,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<P: Send + Sync + 'static> MergingPushQueue<P> {
    /// Creates the queue and spawns `worker_count` (minimum 1) draining
    /// tasks bound to `registry`.
    pub fn new(registry: Arc<ConnectionRegistry<P>>, metrics: Arc<dyn MetricsRecorder>, worker_count: usize) -> Arc<Self> {
        let queue = Arc::new(MergingPushQueue {
            registry,
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            metrics,
        });
        for _ in 0..worker_count.max(1) {
            let worker = Arc::clone(&queue);
            tokio::spawn(async move { worker.run_worker().await });
        }
        queue
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            let batch: Vec<(ConnectionId, PushRequest)> = {
                let mut pending = self.pending.lock().unwrap();
                pending.drain().collect()
            };
            for (id, request) in batch {
                self.deliver(id, request).await;
            }
        }
    }

    async fn deliver(&self, id: ConnectionId, request: PushRequest) {
        let Some(connection) = self.registry.get(&id).await else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        let event = Event {
            push_request: request,
            done: done_tx,
        };
        if connection.push_tx.send(event).await.is_err() {
            self.metrics.push_failure("push channel closed before delivery");
            return;
        }
        let _ = done_rx.await;
    }
}

impl<P: Send + Sync + 'static> PushQueue for MergingPushQueue<P> {
    fn enqueue(&self, id: ConnectionId, request: PushRequest) {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(&id) {
            Some(existing) => {
                pending.insert(id, merge(existing, request));
            }
            None => {
                pending.insert(id, request);
            }
        }
        drop(pending);
        self.notify.notify_one();
    }
}
