//! The per-stream session loop: the single writer of
//! the outbound stream and the sole mutator of each [`WatchedResource`]'s
//! "sent" fields.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tonic::Status;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionIdAllocator};
use crate::error::{is_expected_transport_error, Error};
use crate::generator::GeneratorRegistry;
use crate::identity::IdentityChecker;
use crate::internal_gen::InternalGenerator;
use crate::metrics::MetricsRecorder;
use crate::proto::{is_builtin_type, DiscoveryRequest, DiscoveryResponse};
use crate::proxy::{Event, ProxySnapshot, PushContext};
use crate::readiness::ReadinessGate;
use crate::registry::ConnectionRegistry;
use crate::status::StatusReporter;
use crate::watched::{classify, Classification, WatchedResource};

/// The collaborators a running session needs, shared across every
/// connection the server holds.
pub struct SessionDeps<P> {
    /// The live-connection table.
    pub registry: Arc<ConnectionRegistry<P>>,
    /// Process-wide connection-id allocator.
    pub id_allocator: ConnectionIdAllocator,
    /// Peer identity matcher, consulted during the handshake.
    pub identity_checker: Arc<dyn IdentityChecker>,
    /// Metric sink.
    pub metrics: Arc<dyn MetricsRecorder>,
    /// Distribution-status sink.
    pub status: Arc<dyn StatusReporter>,
    /// Connection-lifecycle/NACK watcher.
    pub internal_gen: Arc<dyn InternalGenerator>,
    /// Named custom generators.
    pub generators: Arc<GeneratorRegistry>,
    /// Gates whether new streams may be accepted.
    pub readiness: Arc<dyn ReadinessGate>,
    /// The current global push-context snapshot.
    pub push_context: RwLock<Arc<dyn PushContext>>,
    /// Server-level tunables.
    pub options: crate::config::ServerOptions,
}

impl<P> SessionDeps<P> {
    /// Creates a deps bundle with the given registry, an initial push
    /// context, and every other collaborator at its default implementation.
    pub fn new(registry: Arc<ConnectionRegistry<P>>, initial_push_context: Arc<dyn PushContext>) -> Self {
        Self::with_options(registry, initial_push_context, crate::config::ServerOptions::default())
    }

    /// As [`Self::new`], but with explicit [`crate::config::ServerOptions`]
    /// (the connection-id allocator is seeded from
    /// `options.node_counter_start`).
    pub fn with_options(
        registry: Arc<ConnectionRegistry<P>>,
        initial_push_context: Arc<dyn PushContext>,
        options: crate::config::ServerOptions,
    ) -> Self {
        SessionDeps {
            registry,
            id_allocator: ConnectionIdAllocator::starting_at(options.node_counter_start),
            identity_checker: Arc::new(crate::identity::SpiffeIdentityChecker),
            metrics: Arc::new(crate::metrics::TracingMetrics),
            status: Arc::new(crate::status::TracingStatusReporter),
            internal_gen: Arc::new(crate::internal_gen::NoopInternalGenerator),
            generators: Arc::new(GeneratorRegistry::new()),
            readiness: Arc::new(crate::readiness::AtomicReadinessGate::new(true)),
            push_context: RwLock::new(initial_push_context),
            options,
        }
    }

    /// Returns the server version string of the currently installed push
    /// context.
    pub async fn current_version(&self) -> String {
        self.push_context.read().await.version().to_string()
    }

    /// Installs a new global push-context snapshot, e.g. after the config
    /// store completes a resync.
    pub async fn set_push_context(&self, ctx: Arc<dyn PushContext>) {
        *self.push_context.write().await = ctx;
    }
}

/// What the receive task observed, forwarded through the capacity-1
/// inbound queue.
enum Inbound {
    Request(DiscoveryRequest),
    Eof,
    Error(Status),
}

/// Spawns the receive task and the session task for one accepted stream,
/// returning the outbound response stream tonic hands back to the peer.
pub fn spawn_session<P: ProxySnapshot>(
    deps: Arc<SessionDeps<P>>,
    inbound: tonic::Streaming<DiscoveryRequest>,
    peer_address: String,
    identities: Vec<String>,
) -> ReceiverStream<Result<DiscoveryResponse, Status>> {
    let (outbound_tx, outbound_rx) = mpsc::channel(16);
    tokio::spawn(session_loop(deps, inbound, peer_address, identities, outbound_tx));
    ReceiverStream::new(outbound_rx)
}

fn spawn_receive_task(mut inbound: tonic::Streaming<DiscoveryRequest>) -> mpsc::Receiver<Inbound> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let event = match inbound.message().await {
                Ok(Some(request)) => Inbound::Request(request),
                Ok(None) => Inbound::Eof,
                Err(status) => Inbound::Error(status),
            };
            let terminal = !matches!(event, Inbound::Request(_));
            if tx.send(event).await.is_err() || terminal {
                break;
            }
        }
    });
    rx
}

async fn session_loop<P: ProxySnapshot>(
    deps: Arc<SessionDeps<P>>,
    inbound: tonic::Streaming<DiscoveryRequest>,
    peer_address: String,
    identities: Vec<String>,
    outbound: mpsc::Sender<Result<DiscoveryResponse, Status>>,
) {
    let mut req_rx = spawn_receive_task(inbound);

    let first_request = match req_rx.recv().await {
        Some(Inbound::Request(request)) => request,
        Some(Inbound::Eof) | None => return,
        Some(Inbound::Error(status)) => {
            if !is_expected_transport_error(&status) {
                deps.metrics.internal_error("transport error before handshake");
            }
            let _ = outbound.send(Err(status)).await;
            return;
        }
    };

    let (connection, push_rx) = match handshake(&deps, &first_request, peer_address, identities).await {
        Ok(v) => v,
        Err(err) => {
            let _ = outbound.send(Err(err.into_status())).await;
            return;
        }
    };

    let result = run_inner(&deps, &connection, first_request, req_rx, push_rx, &outbound).await;

    let version = deps.current_version().await;
    deps.registry.disconnect(&connection.id, &version, deps.metrics.as_ref()).await;
    deps.internal_gen.on_disconnect(&connection.id.0);
    deps.status.register_disconnect(&connection.id.0);

    if let Err(err) = result {
        let quiet = matches!(&err, Error::Transport(status) if is_expected_transport_error(status));
        if !quiet {
            let _ = outbound.send(Err(err.into_status())).await;
        }
    }
}

async fn run_inner<P: ProxySnapshot>(
    deps: &Arc<SessionDeps<P>>,
    connection: &Arc<Connection<P>>,
    first_request: DiscoveryRequest,
    mut req_rx: mpsc::Receiver<Inbound>,
    mut push_rx: mpsc::Receiver<Event>,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    handle_request(deps, connection, first_request, outbound).await?;

    loop {
        tokio::select! {
            inbound = req_rx.recv() => {
                match inbound {
                    Some(Inbound::Request(request)) => {
                        handle_request(deps, connection, request, outbound).await?;
                    }
                    Some(Inbound::Eof) | None => return Ok(()),
                    Some(Inbound::Error(status)) => {
                        if is_expected_transport_error(&status) {
                            return Ok(());
                        }
                        deps.metrics.internal_error("transport error on receive");
                        return Err(Error::Transport(status));
                    }
                }
            }
            Some(event) = push_rx.recv() => {
                let push_result = crate::push::push_connection(deps, connection, &event, outbound).await;
                let _ = event.done.send(());
                if let Err(err) = push_result {
                    deps.metrics.push_failure(&err.to_string());
                    return Ok(());
                }
            }
        }
    }
}

async fn handshake<P: ProxySnapshot>(
    deps: &Arc<SessionDeps<P>>,
    first_request: &DiscoveryRequest,
    peer_address: String,
    identities: Vec<String>,
) -> Result<(Arc<Connection<P>>, mpsc::Receiver<Event>), Error> {
    let node = first_request.node.as_ref().ok_or(Error::MissingNodeId)?;
    if node.id.is_empty() {
        return Err(Error::MissingNodeId);
    }

    let mut proxy = P::from_node(node);
    let ctx = deps.push_context.read().await.clone();
    proxy.set_proxy_state(ctx.as_ref());

    if deps.options.require_identity && !identities.is_empty() {
        let authorized = deps
            .identity_checker
            .authorized(&identities, proxy.config_namespace(), proxy.service_account());
        if !authorized {
            return Err(Error::Unauthorized {
                node_id: node.id.clone(),
            });
        }
    }

    let connection_id = deps.id_allocator.allocate(&node.id);
    let (connection, push_rx) = Connection::new(connection_id.clone(), peer_address, identities, proxy);
    let connection = Arc::new(connection);

    deps.registry
        .connect(Arc::clone(&connection), ctx.version(), deps.metrics.as_ref())
        .await;
    deps.internal_gen.on_connect(&connection_id.0, &node.id);

    Ok((connection, push_rx))
}

async fn handle_request<P: ProxySnapshot>(
    deps: &SessionDeps<P>,
    connection: &Connection<P>,
    request: DiscoveryRequest,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    let type_url = request.type_url.clone();

    if let Some(detail) = &request.error_detail {
        deps.metrics.reject(&type_url, detail.code);
        deps.internal_gen.on_nack(&connection.id.0, &type_url, &detail.message);
        return Ok(());
    }

    // CDS/LDS are pushed unconditionally on first subscription; the
    // reconciler only decides whether a *later* request on that type owes
    // a response.
    let gated = matches!(type_url.as_str(), crate::proto::CLUSTER_TYPE | crate::proto::LISTENER_TYPE);

    let should_respond = {
        let mut watched = connection.watched_resources.write().await;
        let already_watching = watched.contains_key(&type_url);
        if gated && !already_watching {
            watched.insert(type_url.clone(), WatchedResource::initial(&request));
            true
        } else {
            let existing = watched.get_mut(&type_url);
            let (classification, new_watch) = classify(&request, existing);
            if classification == Classification::Stale {
                deps.metrics.expired_nonce(&type_url);
            }
            if let Some(watch) = new_watch {
                watched.insert(type_url.clone(), watch);
            }
            classification.should_respond()
        }
    };

    if !should_respond {
        return Ok(());
    }

    if let Some(response) = compute_response(deps, connection, &type_url, &request.resource_names).await? {
        send_response(deps, connection, &type_url, response, outbound).await?;
    }
    Ok(())
}

/// Computes the response for `type_url`/`names` against the current proxy
/// and push context: generator indirection when the proxy selected one,
/// otherwise a built-in-type response, otherwise nothing.
pub(crate) async fn compute_response<P: ProxySnapshot>(
    deps: &SessionDeps<P>,
    connection: &Connection<P>,
    type_url: &str,
    names: &[String],
) -> Result<Option<DiscoveryResponse>, Error> {
    let proxy = connection.proxy.read().await;
    let ctx = deps.push_context.read().await.clone();

    if !is_builtin_type(type_url) {
        return match proxy.generator_name() {
            Some(generator_name) => match deps.generators.get(generator_name) {
                Some(generator) => generator
                    .generate(&*proxy, type_url, ctx.as_ref(), names)
                    .map_err(|e| Error::Push(e.to_string())),
                None => Ok(None),
            },
            None => Ok(None),
        };
    }
    drop(proxy);

    Ok(Some(DiscoveryResponse {
        version_info: ctx.version().to_string(),
        resources: Vec::new(),
        canary: false,
        type_url: type_url.to_string(),
        nonce: Uuid::new_v4().to_string(),
        control_plane: None,
        resource_errors: Vec::new(),
    }))
}

/// Sends `response` subject to the configured send timeout, recording
/// "sent" bookkeeping on success only.
pub(crate) async fn send_response<P>(
    deps: &SessionDeps<P>,
    connection: &Connection<P>,
    type_url: &str,
    response: DiscoveryResponse,
    outbound: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Error> {
    let nonce = response.nonce.clone();
    let version_info = response.version_info.clone();
    let size: usize = response.resources.iter().map(|a| a.value.len()).sum();

    match timeout(deps.options.send_timeout, outbound.send(Ok(response))).await {
        Ok(Ok(())) => {
            let mut watched = connection.watched_resources.write().await;
            if let Some(watch) = watched.get_mut(type_url) {
                if !nonce.is_empty() {
                    watch.nonce_sent = nonce;
                }
                watch.version_sent = version_info;
                watch.last_sent = Some(Instant::now());
                watch.last_size = size;
            }
            Ok(())
        }
        Ok(Err(_)) => Err(Error::Transport(Status::unavailable("client disconnected"))),
        Err(_) => {
            deps.metrics.write_timeout(type_url);
            Err(Error::SendTimeout {
                type_url: type_url.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CLUSTER_TYPE;
    use crate::proxy::{SimplePushContext, StaticProxy};
    use std::collections::HashSet;
    use std::time::Duration;

    fn deps() -> Arc<SessionDeps<StaticProxy>> {
        let registry = Arc::new(ConnectionRegistry::new());
        Arc::new(SessionDeps::new(registry, Arc::new(SimplePushContext::new("v1"))))
    }

    fn request(nonce: &str, version: &str, names: &[&str], node_id: Option<&str>) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: version.to_string(),
            node: node_id.map(|id| crate::proto::Node {
                id: id.to_string(),
                ..Default::default()
            }),
            resource_names: names.iter().map(|s| s.to_string()).collect(),
            type_url: CLUSTER_TYPE.to_string(),
            response_nonce: nonce.to_string(),
            error_detail: None,
            resource_locators: Vec::new(),
        }
    }

    #[tokio::test]
    async fn missing_node_id_on_first_request_is_rejected_before_registration() {
        let deps = deps();
        let first = request("", "", &[], None);

        let err = handshake(&deps, &first, "127.0.0.1:0".into(), vec![]).await.unwrap_err();

        assert!(matches!(err, Error::MissingNodeId));
        assert!(deps.registry.is_empty().await);
    }

    #[tokio::test]
    async fn clean_cds_ack_then_ack_noop_produces_single_response() {
        let deps = deps();
        let (outbound, mut outbound_rx) = mpsc::channel(4);

        let first = request("", "", &[], Some("node-1"));
        let (connection, _push_rx) = handshake(&deps, &first, "127.0.0.1:0".into(), vec![]).await.unwrap();
        handle_request(&deps, &connection, first, &outbound).await.unwrap();

        let sent = tokio::time::timeout(Duration::from_secs(1), outbound_rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sent.type_url, CLUSTER_TYPE);
        let nonce = sent.nonce.clone();

        let ack = request(&nonce, &sent.version_info, &[], Some("node-1"));
        handle_request(&deps, &connection, ack, &outbound).await.unwrap();

        assert!(outbound_rx.try_recv().is_err());
        let watched = connection.watched_resources.read().await;
        let watch = watched.get(CLUSTER_TYPE).unwrap();
        assert_eq!(watch.nonce_acked, nonce);
    }

    #[tokio::test]
    async fn stale_nonce_is_ignored_and_bumps_metric() {
        let deps = deps();
        let (outbound, mut outbound_rx) = mpsc::channel(4);
        let first = request("", "", &[], Some("node-1"));
        let (connection, _push_rx) = handshake(&deps, &first, "127.0.0.1:0".into(), vec![]).await.unwrap();
        handle_request(&deps, &connection, first, &outbound).await.unwrap();
        let _ = outbound_rx.recv().await.unwrap().unwrap();

        let stale = request("n0", "v0", &[], Some("node-1"));
        handle_request(&deps, &connection, stale, &outbound).await.unwrap();
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resource_change_triggers_a_new_response() {
        let deps = deps();
        let (outbound, mut outbound_rx) = mpsc::channel(4);
        let first = request("", "", &[], Some("node-1"));
        let (connection, _push_rx) = handshake(&deps, &first, "127.0.0.1:0".into(), vec![]).await.unwrap();
        handle_request(&deps, &connection, first, &outbound).await.unwrap();
        let first_sent = outbound_rx.recv().await.unwrap().unwrap();

        let changed = request(&first_sent.nonce, &first_sent.version_info, &["c1", "c2"], Some("node-1"));
        handle_request(&deps, &connection, changed, &outbound).await.unwrap();
        let second_sent = outbound_rx.recv().await.unwrap().unwrap();
        assert_ne!(second_sent.nonce, first_sent.nonce);

        let watched = connection.watched_resources.read().await;
        let names: HashSet<String> = watched.get(CLUSTER_TYPE).unwrap().resource_names.clone();
        assert!(names.contains("c1") && names.contains("c2"));
    }

    #[tokio::test]
    async fn reconnect_with_nonzero_nonce_and_no_prior_watch_gets_a_response() {
        let deps = deps();
        let (outbound, mut outbound_rx) = mpsc::channel(4);
        let mut first = request("nZ", "vZ", &[], Some("node-1"));
        first.type_url = crate::proto::LISTENER_TYPE.to_string();
        let (connection, _push_rx) = handshake(&deps, &first, "127.0.0.1:0".into(), vec![]).await.unwrap();
        handle_request(&deps, &connection, first, &outbound).await.unwrap();
        let sent = outbound_rx.recv().await.unwrap().unwrap();
        assert_eq!(sent.type_url, crate::proto::LISTENER_TYPE);
    }

    #[tokio::test]
    async fn nack_produces_no_response_and_notifies_internal_generator() {
        let deps = deps();
        let (outbound, mut outbound_rx) = mpsc::channel(4);
        let first = request("", "", &[], Some("node-1"));
        let (connection, _push_rx) = handshake(&deps, &first, "127.0.0.1:0".into(), vec![]).await.unwrap();
        handle_request(&deps, &connection, first, &outbound).await.unwrap();
        let _ = outbound_rx.recv().await.unwrap().unwrap();

        let mut nack = request("bad-nonce", "", &[], Some("node-1"));
        nack.error_detail = Some(crate::proto::ErrorDetail {
            code: 3,
            message: "bad".into(),
            details: vec![],
        });
        handle_request(&deps, &connection, nack, &outbound).await.unwrap();
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn compute_response_ignores_generator_for_builtin_types() {
        let deps = deps();
        let proxy = StaticProxy::new("node-1").with_generator("unregistered");
        let (connection, _push_rx) = crate::connection::Connection::new(
            crate::connection::ConnectionId("node-1-1".into()),
            "127.0.0.1:0".into(),
            vec![],
            proxy,
        );

        let response = compute_response(&deps, &connection, CLUSTER_TYPE, &[]).await.unwrap();
        assert!(response.is_some());
    }
}
