//! A runnable ADS server binary wiring [`ads_core`] to a real `tonic`
//! transport, for manual exercise of the crate.

use std::net::SocketAddr;
use std::sync::Arc;

use ads_core::proto::AggregatedDiscoveryServiceServer;
use ads_core::push_queue::MergingPushQueue;
use ads_core::session::SessionDeps;
use ads_core::{AdsService, ConnectionRegistry, SimplePushContext, StaticProxy};
use tonic::transport::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = std::env::var("ADS_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:18000".to_string())
        .parse()?;

    let registry: Arc<ConnectionRegistry<StaticProxy>> = Arc::new(ConnectionRegistry::new());
    let deps = Arc::new(SessionDeps::new(registry.clone(), Arc::new(SimplePushContext::new("0"))));

    // Wires the push dispatcher to the same registry the service hands out
    // connections into; a real deployment would drive `ads_core::push::ads_push_all`
    // from its config-store change feed instead of leaving the queue idle.
    let _push_queue = MergingPushQueue::new(registry, Arc::clone(&deps.metrics), 4);

    let service = AdsService::new(deps);

    tracing::info!(%addr, "ads server listening");
    Server::builder()
        .add_service(AggregatedDiscoveryServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
