//! Crate-wide aliases over the generated `envoy.service.discovery.v3` messages.
//!
//! The wire schema is supplied by `envoy-types` rather than a crate-local
//! `.proto`/`tonic-build` pair — the discovery envelope is standard xDS and
//! `envoy-types` already vendors it, so there is nothing project-specific to
//! generate.

pub use envoy_types::pb::envoy::config::core::v3::{Locality, Node};
pub use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{AggregatedDiscoveryService, AggregatedDiscoveryServiceServer},
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
pub use envoy_types::pb::google::protobuf::Any;
pub use envoy_types::pb::google::rpc::Status as ErrorDetail;

/// `type.googleapis.com/envoy.config.cluster.v3.Cluster`
pub const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
/// `type.googleapis.com/envoy.config.listener.v3.Listener`
pub const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
/// `type.googleapis.com/envoy.config.route.v3.RouteConfiguration`
pub const ROUTE_TYPE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
/// `type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment`
pub const ENDPOINT_TYPE: &str = "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// Returns `true` for the four built-in request types handled without a [`crate::generator::Generator`].
pub fn is_builtin_type(type_url: &str) -> bool {
    matches!(
        type_url,
        CLUSTER_TYPE | LISTENER_TYPE | ROUTE_TYPE | ENDPOINT_TYPE
    )
}

/// Reads a string-valued field out of a node's metadata struct, e.g. the
/// `NAMESPACE`/`SERVICE_ACCOUNT`/`GENERATOR` keys istio-style metadata
/// carries.
pub fn metadata_string(node: &Node, key: &str) -> Option<String> {
    let fields = &node.metadata.as_ref()?.fields;
    match fields.get(key)?.kind.as_ref()? {
        envoy_types::pb::google::protobuf::value::Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}
