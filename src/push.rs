//! The per-connection push handler and the two global dispatch entry
//! points.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tonic::Status;

use crate::cache::ResponseCache;
use crate::connection::{Connection, ResourceKey};
use crate::error::Error;
use crate::proto::{DiscoveryResponse, CLUSTER_TYPE, ENDPOINT_TYPE, LISTENER_TYPE, ROUTE_TYPE};
use crate::proxy::{Event, ProxySnapshot, PushContext, PushRequest};
use crate::push_queue::PushQueue;
use crate::registry::ConnectionRegistry;
use crate::session::{compute_response, send_response, SessionDeps};

/// Runs one [`Event`] against `connection`: the incremental/full push
/// branches. Invoked from the session loop's select arm; the session loop
/// (not this function) calls `event.done`.
pub(crate) async fn push_connection<P: ProxySnapshot>(
    deps: &SessionDeps<P>,
    connection: &Arc<Connection<P>>,
    event: &Event,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    let request = &event.push_request;
    let ctx: &dyn PushContext = request.push_context.as_ref();

    if !request.full {
        return push_incremental(deps, connection, request, ctx, outbound).await;
    }
    push_full(deps, connection, request, ctx, outbound).await
}

async fn push_incremental<P: ProxySnapshot>(
    deps: &SessionDeps<P>,
    connection: &Arc<Connection<P>>,
    request: &PushRequest,
    _ctx: &dyn PushContext,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    let needs_push = connection.proxy.read().await.needs_push(request);
    if !needs_push {
        return Ok(());
    }

    let updated_services: Vec<&str> = request
        .configs_updated
        .iter()
        .filter(|key| key.kind == "ServiceEntry")
        .map(|key| key.name.as_str())
        .collect();
    if updated_services.is_empty() {
        return Ok(());
    }

    let watching_clusters = connection.watched_resources.read().await.contains_key(CLUSTER_TYPE);
    if !watching_clusters {
        return Ok(());
    }

    let names: Vec<String> = {
        let watched = connection.watched_resources.read().await;
        watched
            .get(ENDPOINT_TYPE)
            .map(|watch| {
                watch
                    .resource_names
                    .iter()
                    .filter(|name| updated_services.contains(&name.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    };
    if names.is_empty() {
        return Ok(());
    }

    if let Some(response) = compute_response(deps, connection, ENDPOINT_TYPE, &names).await? {
        send_response(deps, connection, ENDPOINT_TYPE, response, outbound).await?;
    }
    Ok(())
}

async fn push_full<P: ProxySnapshot>(
    deps: &SessionDeps<P>,
    connection: &Arc<Connection<P>>,
    request: &PushRequest,
    ctx: &dyn PushContext,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    {
        let mut proxy = connection.proxy.write().await;
        proxy.update_proxy(ctx);
    }

    let needs_push = connection.proxy.read().await.needs_push(request);
    if !needs_push {
        for type_url in [CLUSTER_TYPE, ENDPOINT_TYPE, LISTENER_TYPE, ROUTE_TYPE] {
            deps.status.register_event(&connection.id.0, type_url, ctx.version());
        }
        return Ok(());
    }

    let generator_name = connection.proxy.read().await.generator_name().map(str::to_string);
    if let Some(name) = generator_name {
        push_via_generator(deps, connection, ctx, &name, outbound).await?;
    } else {
        push_builtin_types(deps, connection, request, ctx, outbound).await?;
    }

    tracing::debug!(
        connection_id = %connection.id,
        latency_ms = request.start.elapsed().as_millis() as u64,
        "push convergence"
    );
    Ok(())
}

async fn push_via_generator<P: ProxySnapshot>(
    deps: &SessionDeps<P>,
    connection: &Arc<Connection<P>>,
    ctx: &dyn PushContext,
    generator_name: &str,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    let generator = deps
        .generators
        .get(generator_name)
        .ok_or_else(|| Error::Push(format!("no generator registered for {generator_name}")))?;

    let watched_types: Vec<String> = connection.watched_resources.read().await.keys().cloned().collect();
    for type_url in watched_types {
        let names: Vec<String> = {
            let watched = connection.watched_resources.read().await;
            watched
                .get(&type_url)
                .map(|watch| watch.resource_names.iter().cloned().collect())
                .unwrap_or_default()
        };
        let response = {
            let proxy = connection.proxy.read().await;
            generator
                .generate(&*proxy, &type_url, ctx, &names)
                .map_err(|e| Error::Push(e.to_string()))?
        };
        if let Some(response) = response {
            send_response(deps, connection, &type_url, response, outbound).await?;
        }
    }
    Ok(())
}

async fn push_builtin_types<P: ProxySnapshot>(
    deps: &SessionDeps<P>,
    connection: &Arc<Connection<P>>,
    request: &PushRequest,
    ctx: &dyn PushContext,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    let (mask, watched_types) = {
        let proxy = connection.proxy.read().await;
        let mask = proxy.push_type_for(request);
        let watched_types: std::collections::HashSet<String> =
            connection.watched_resources.read().await.keys().cloned().collect();
        (mask, watched_types)
    };
    let watching_clusters = watched_types.contains(CLUSTER_TYPE);
    let watching_routes = watched_types.contains(ROUTE_TYPE);

    let plan = [
        (CLUSTER_TYPE, watched_types.contains(CLUSTER_TYPE) && mask.cds),
        (ENDPOINT_TYPE, watching_clusters && mask.eds),
        (LISTENER_TYPE, watched_types.contains(LISTENER_TYPE) && mask.lds),
        (ROUTE_TYPE, watching_routes && mask.rds),
    ];

    for (type_url, eligible) in plan {
        if eligible {
            let names: Vec<String> = {
                let watched = connection.watched_resources.read().await;
                watched
                    .get(type_url)
                    .map(|watch| watch.resource_names.iter().cloned().collect())
                    .unwrap_or_default()
            };
            if let Some(response) = compute_response(deps, connection, type_url, &names).await? {
                send_response(deps, connection, type_url, response, outbound).await?;
            }
        } else {
            deps.status.register_event(&connection.id.0, type_url, ctx.version());
        }
    }
    Ok(())
}

/// Finds the unique connection whose proxy carries `cluster_id` and whose
/// peer address matches `ip`, and enqueues a full push for it. Does
/// nothing if no match is found.
pub async fn proxy_update<P: ProxySnapshot>(
    registry: &ConnectionRegistry<P>,
    queue: &dyn PushQueue,
    push_context: Arc<dyn PushContext>,
    cluster_id: &str,
    ip: &str,
) {
    for connection in registry.snapshot().await {
        let matches = {
            let proxy = connection.proxy.read().await;
            proxy.cluster_id() == Some(cluster_id)
                && (connection.peer_address == ip || connection.peer_address.starts_with(&format!("{ip}:")))
        };
        if matches {
            queue.enqueue(
                connection.id.clone(),
                PushRequest::full(push_context, vec!["proxy-update".to_string()]),
            );
            return;
        }
    }
}

/// Clears the response cache, stamps `request.start`, snapshots the
/// registry, and enqueues `request` against every connection.
pub async fn ads_push_all<P: ProxySnapshot>(
    registry: &ConnectionRegistry<P>,
    cache: &dyn ResponseCache,
    queue: &dyn PushQueue,
    mut request: PushRequest,
) {
    if request.configs_updated.is_empty() {
        cache.clear_all();
    } else {
        let keys: Vec<ResourceKey> = request
            .configs_updated
            .iter()
            .map(|key| ResourceKey {
                name: key.name.clone(),
                type_url: key.kind.clone(),
            })
            .collect();
        cache.clear(&keys);
    }

    request.start = Instant::now();
    let snapshot = registry.snapshot().await;
    tracing::debug!(connections = snapshot.len(), full = request.full, "ads push all");
    for connection in &snapshot {
        queue.enqueue(connection.id.clone(), request.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryResponseCache;
    use crate::connection::ConnectionId;
    use crate::proxy::{ConfigKey, SimplePushContext, StaticProxy};
    use crate::watched::WatchedResource;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn test_deps() -> SessionDeps<StaticProxy> {
        let registry = Arc::new(ConnectionRegistry::new());
        SessionDeps::new(registry, Arc::new(SimplePushContext::new("v1")))
    }

    fn discovery_request(type_url: &str, names: &[&str]) -> crate::proto::DiscoveryRequest {
        crate::proto::DiscoveryRequest {
            version_info: String::new(),
            node: None,
            resource_names: names.iter().map(|s| s.to_string()).collect(),
            type_url: type_url.to_string(),
            response_nonce: String::new(),
            error_detail: None,
            resource_locators: Vec::new(),
        }
    }

    async fn event(request: PushRequest) -> (Event, oneshot::Receiver<()>) {
        let (done_tx, done_rx) = oneshot::channel();
        (
            Event {
                push_request: request,
                done: done_tx,
            },
            done_rx,
        )
    }

    #[tokio::test]
    async fn incremental_push_sends_eds_only_for_updated_service() {
        let deps = test_deps();
        let proxy = StaticProxy::new("node-1");
        let (connection, _push_rx) = Connection::new(
            ConnectionId("node-1-1".into()),
            "127.0.0.1:0".into(),
            vec![],
            proxy,
        );
        let connection = Arc::new(connection);
        {
            let mut watched = connection.watched_resources.write().await;
            watched.insert(CLUSTER_TYPE.to_string(), WatchedResource::initial(&discovery_request(CLUSTER_TYPE, &[])));
            watched.insert(ENDPOINT_TYPE.to_string(), WatchedResource::initial(&discovery_request(ENDPOINT_TYPE, &["x"])));
        }

        let (outbound, mut outbound_rx) = mpsc::channel(4);
        let ctx: Arc<dyn PushContext> = Arc::new(SimplePushContext::new("v2"));
        let request = PushRequest::incremental(
            ctx,
            [ConfigKey::service_entry("x")].into_iter().collect(),
            vec!["service changed".into()],
        );
        let (evt, _done_rx) = event(request).await;

        push_connection(&deps, &connection, &evt, &outbound).await.unwrap();

        let sent = tokio::time::timeout(Duration::from_secs(1), outbound_rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sent.type_url, ENDPOINT_TYPE);
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_push_emits_every_watched_and_eligible_type() {
        let deps = test_deps();
        let proxy = StaticProxy::new("node-1");
        let (connection, _push_rx) = Connection::new(
            ConnectionId("node-1-1".into()),
            "127.0.0.1:0".into(),
            vec![],
            proxy,
        );
        let connection = Arc::new(connection);
        {
            let mut watched = connection.watched_resources.write().await;
            watched.insert(CLUSTER_TYPE.to_string(), WatchedResource::initial(&discovery_request(CLUSTER_TYPE, &[])));
            watched.insert(LISTENER_TYPE.to_string(), WatchedResource::initial(&discovery_request(LISTENER_TYPE, &[])));
            watched.insert(ROUTE_TYPE.to_string(), WatchedResource::initial(&discovery_request(ROUTE_TYPE, &[])));
        }

        let (outbound, mut outbound_rx) = mpsc::channel(8);
        let ctx: Arc<dyn PushContext> = Arc::new(SimplePushContext::new("v2"));
        let request = PushRequest::full(ctx, vec!["resync".into()]);
        let (evt, _done_rx) = event(request).await;

        push_connection(&deps, &connection, &evt, &outbound).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let sent = tokio::time::timeout(Duration::from_secs(1), outbound_rx.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.insert(sent.type_url);
        }
        assert!(seen.contains(CLUSTER_TYPE));
        assert!(seen.contains(ENDPOINT_TYPE));
        assert!(seen.contains(LISTENER_TYPE));
        assert!(seen.contains(ROUTE_TYPE));
    }

    #[tokio::test]
    async fn ads_push_all_clears_cache_and_enqueues_every_connection() {
        let registry: Arc<ConnectionRegistry<StaticProxy>> = Arc::new(ConnectionRegistry::new());
        let (connection, _push_rx) = Connection::new(
            ConnectionId("node-1-1".into()),
            "127.0.0.1:0".into(),
            vec![],
            StaticProxy::new("node-1"),
        );
        registry
            .connect(Arc::new(connection), "v1", &crate::metrics::TracingMetrics)
            .await;

        let cache = InMemoryResponseCache::new();
        let key = ResourceKey {
            name: "a".into(),
            type_url: "ServiceEntry".into(),
        };
        cache.mark_fresh(key.clone());

        struct RecordingQueue {
            calls: std::sync::Mutex<Vec<ConnectionId>>,
        }
        impl PushQueue for RecordingQueue {
            fn enqueue(&self, id: ConnectionId, _request: PushRequest) {
                self.calls.lock().unwrap().push(id);
            }
        }
        let queue = RecordingQueue {
            calls: std::sync::Mutex::new(Vec::new()),
        };

        let ctx: Arc<dyn PushContext> = Arc::new(SimplePushContext::new("v2"));
        let request = PushRequest::full(ctx, vec!["resync".into()]);
        ads_push_all(&registry, &cache, &queue, request).await;

        assert!(cache.is_empty());
        assert_eq!(queue.calls.lock().unwrap().len(), 1);
    }
}
