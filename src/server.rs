//! The `AggregatedDiscoveryService` endpoint wiring the session state
//! machine into a tonic-generated service.

use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::proto::{
    AggregatedDiscoveryService, DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use crate::error::Error;
use crate::proxy::ProxySnapshot;
use crate::session::{spawn_session, SessionDeps};

/// Server-side `AggregatedDiscoveryService` endpoint. Generic over the
/// concrete [`ProxySnapshot`] implementation a deployment plugs in.
pub struct AdsService<P> {
    deps: Arc<SessionDeps<P>>,
}

impl<P> AdsService<P> {
    /// Wraps `deps` as a tonic service.
    pub fn new(deps: Arc<SessionDeps<P>>) -> Self {
        AdsService { deps }
    }

    /// Returns the shared deps, e.g. so a caller can drive
    /// [`crate::push::ads_push_all`] against the same registry.
    pub fn deps(&self) -> &Arc<SessionDeps<P>> {
        &self.deps
    }
}

/// Extension type a transport-layer interceptor inserts to carry
/// authenticated peer identities into the service method — certificate
/// validation itself is out of scope for this crate.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentities(pub Vec<String>);

fn extract_identities<T>(request: &Request<T>) -> Vec<String> {
    request
        .extensions()
        .get::<PeerIdentities>()
        .map(|identities| identities.0.clone())
        .unwrap_or_default()
}

#[tonic::async_trait]
impl<P: ProxySnapshot> AggregatedDiscoveryService for AdsService<P> {
    type StreamAggregatedResourcesStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        if !self.deps.readiness.is_ready() {
            return Err(Error::NotReady.into_status());
        }

        let peer_address = request.remote_addr().map(|addr| addr.to_string()).unwrap_or_default();
        let identities = extract_identities(&request);
        let inbound = request.into_inner();

        let stream = spawn_session(Arc::clone(&self.deps), inbound, peer_address, identities);
        Ok(Response::new(stream))
    }

    type DeltaAggregatedResourcesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{SimplePushContext, StaticProxy};
    use crate::readiness::AtomicReadinessGate;
    use crate::registry::ConnectionRegistry;

    #[tokio::test]
    async fn service_wraps_deps_without_panicking() {
        let registry = Arc::new(ConnectionRegistry::<StaticProxy>::new());
        let deps = Arc::new(SessionDeps::new(registry, Arc::new(SimplePushContext::new("v1"))));
        let service = AdsService::new(deps);
        assert!(service.deps().registry.is_empty().await);
    }

    #[tokio::test]
    async fn not_ready_gate_reports_unready_and_maps_to_unavailable() {
        let registry = Arc::new(ConnectionRegistry::<StaticProxy>::new());
        let mut deps = SessionDeps::new(registry, Arc::new(SimplePushContext::new("v1")));
        deps.readiness = Arc::new(AtomicReadinessGate::new(false));
        let service = AdsService::new(Arc::new(deps));

        assert!(!service.deps().readiness.is_ready());
        assert_eq!(crate::error::Error::NotReady.into_status().code(), tonic::Code::Unavailable);
    }
}
