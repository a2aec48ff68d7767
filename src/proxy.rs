//! The proxy snapshot, push-context, and push-request types.
//!
//! [`ProxySnapshot`] and [`PushContext`] are the external contract: the real
//! config graph, sidecar-scope computation, and workload discovery live
//! outside this crate. This module
//! defines the trait shape those collaborators must satisfy, plus one
//! concrete, minimal implementation of each (`StaticProxy`,
//! `SimplePushContext`) that's enough to exercise the full reconciliation
//! and push state machine without a real control plane behind it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::proto::{metadata_string, Locality, Node};

/// Joins a `Locality`'s non-empty `region`/`zone`/`sub_zone` fields with
/// `/`, e.g. `"us-east-1/us-east-1a"`. Returns `None` if all three are empty.
fn locality_string(locality: &Locality) -> Option<String> {
    let parts: Vec<&str> = [
        locality.region.as_str(),
        locality.zone.as_str(),
        locality.sub_zone.as_str(),
    ]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// An immutable snapshot of the global configuration graph at the moment a
/// push was scheduled.
pub trait PushContext: Send + Sync + 'static {
    /// The server version string stamped on responses computed against
    /// this snapshot.
    fn version(&self) -> &str;
}

/// A minimal concrete [`PushContext`] good enough to exercise pushes end to
/// end: just a version string.
#[derive(Debug, Clone)]
pub struct SimplePushContext {
    version: String,
}

impl SimplePushContext {
    /// Creates a push context stamped with `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl PushContext for SimplePushContext {
    fn version(&self) -> &str {
        &self.version
    }
}

/// Which of the four built-in types are owed a push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushTypeMask {
    /// Whether CDS is owed.
    pub cds: bool,
    /// Whether EDS is owed.
    pub eds: bool,
    /// Whether LDS is owed.
    pub lds: bool,
    /// Whether RDS is owed.
    pub rds: bool,
}

impl PushTypeMask {
    /// A mask with every type owed; the common case absent a more specific
    /// policy.
    pub fn all() -> Self {
        PushTypeMask {
            cds: true,
            eds: true,
            lds: true,
            rds: true,
        }
    }
}

/// A config-store entity key: its kind (e.g. `"ServiceEntry"`) and name.
/// Incremental EDS pushes are restricted to `ServiceEntry` keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    /// The config kind, e.g. `"ServiceEntry"`.
    pub kind: String,
    /// The resource's name.
    pub name: String,
}

impl ConfigKey {
    /// Creates a key for a `ServiceEntry` named `name`.
    pub fn service_entry(name: impl Into<String>) -> Self {
        ConfigKey {
            kind: "ServiceEntry".to_string(),
            name: name.into(),
        }
    }
}

/// A scheduled push. `full = true` with an empty
/// `configs_updated` means "rebuild everything; cache cannot be reused".
pub struct PushRequest {
    /// Whether this is a full push (all subscribed types reconsidered) or
    /// an incremental EDS-only push.
    pub full: bool,
    /// The push context to compute responses against.
    pub push_context: Arc<dyn PushContext>,
    /// The config keys that changed, triggering this push. May be empty on
    /// a full push triggered by a resync.
    pub configs_updated: HashSet<ConfigKey>,
    /// When fan-out for this request began.
    pub start: Instant,
    /// Human-readable trigger tags, for logging.
    pub reason: Vec<String>,
}

impl Clone for PushRequest {
    fn clone(&self) -> Self {
        PushRequest {
            full: self.full,
            push_context: Arc::clone(&self.push_context),
            configs_updated: self.configs_updated.clone(),
            start: self.start,
            reason: self.reason.clone(),
        }
    }
}

impl PushRequest {
    /// Creates a full push request stamped with `start = Instant::now()`.
    pub fn full(push_context: Arc<dyn PushContext>, reason: Vec<String>) -> Self {
        PushRequest {
            full: true,
            push_context,
            configs_updated: HashSet::new(),
            start: Instant::now(),
            reason,
        }
    }

    /// Creates an incremental push request for the given updated configs.
    pub fn incremental(
        push_context: Arc<dyn PushContext>,
        configs_updated: HashSet<ConfigKey>,
        reason: Vec<String>,
    ) -> Self {
        PushRequest {
            full: false,
            push_context,
            configs_updated,
            start: Instant::now(),
            reason,
        }
    }

    /// Ensures `configs_updated` is present as an empty set rather than
    /// conceptually absent.
    pub fn with_configs_updated_defaulted(mut self) -> Self {
        if self.configs_updated.is_empty() {
            self.configs_updated = HashSet::new();
        }
        self
    }
}

/// A unit of push work delivered to a connection's push channel.
/// `done` must be invoked exactly once by whoever processes the
/// event, whether or not processing succeeded — a dropped or double-fired
/// `done` would wedge the push queue worker waiting on it.
pub struct Event {
    /// The push to process.
    pub push_request: PushRequest,
    /// One-shot completion signal for the push queue worker that enqueued
    /// this event.
    pub done: tokio::sync::oneshot::Sender<()>,
}

/// The per-proxy state the session loop and push handler read and mutate.
/// `set_proxy_state` runs once, on the first-request
/// handshake; `update_proxy` re-derives the mutable fields (workload
/// labels, service instances, sidecar scope, gateways, locality) on every
/// full push.
pub trait ProxySnapshot: Send + Sync + 'static {
    /// Parses the first request's `node` into a fresh proxy.
    /// Implementations read whatever metadata keys
    /// (generator selector, service account, istio version, ...) their
    /// config-graph integration cares about; unrecognized keys are ignored.
    fn from_node(node: &Node) -> Self
    where
        Self: Sized;
    /// The node id the proxy identified itself with.
    fn node_id(&self) -> &str;
    /// The cluster id the proxy's node metadata carried, if any (used by
    /// [`crate::push::proxy_update`]'s single-connection lookup).
    fn cluster_id(&self) -> Option<&str>;
    /// The namespace the proxy's workload lives in, if known.
    fn config_namespace(&self) -> Option<&str>;
    /// The proxy's service account, if known (used for identity matching).
    fn service_account(&self) -> Option<&str>;
    /// The generator name the proxy's metadata selected, if any. When
    /// present, custom type-urls and full pushes route through
    /// [`crate::generator::Generator`] instead of the built-in per-type
    /// handlers.
    fn generator_name(&self) -> Option<&str>;
    /// The proxy's locality, if derived.
    fn locality(&self) -> Option<&str>;
    /// Initializes the proxy's computed state from the first request,
    /// against the push context in effect at handshake time.
    fn set_proxy_state(&mut self, ctx: &dyn PushContext);
    /// Re-derives workload labels, service instances, sidecar scope,
    /// gateways, and (if still unset) locality against `ctx` on a full push.
    fn update_proxy(&mut self, ctx: &dyn PushContext);
    /// Whether this proxy needs a push at all for `event`, per the
    /// external `ProxyNeedsPush` policy.
    fn needs_push(&self, event: &PushRequest) -> bool;
    /// Which per-type pushes are owed on a full push, per the external
    /// `PushTypeFor` policy.
    fn push_type_for(&self, event: &PushRequest) -> PushTypeMask;
}

/// A minimal, self-contained [`ProxySnapshot`] good enough to exercise the
/// full session/push state machine in tests without a real config graph or
/// sidecar-scope computation behind it.
#[derive(Debug, Clone)]
pub struct StaticProxy {
    node_id: String,
    cluster_id: Option<String>,
    config_namespace: Option<String>,
    service_account: Option<String>,
    generator_name: Option<String>,
    locality: Option<String>,
    /// When `Some`, overrides the default "push everything" policy so
    /// tests can exercise the "proxy doesn't need a push" branch.
    needs_push_override: Option<bool>,
}

impl StaticProxy {
    /// Creates a proxy identified by `node_id` with no namespace, service
    /// account, or generator selected.
    pub fn new(node_id: impl Into<String>) -> Self {
        StaticProxy {
            node_id: node_id.into(),
            cluster_id: None,
            config_namespace: None,
            service_account: None,
            generator_name: None,
            locality: None,
            needs_push_override: None,
        }
    }

    /// Sets the config namespace and service account, for identity-check
    /// tests.
    pub fn with_identity(mut self, namespace: impl Into<String>, service_account: impl Into<String>) -> Self {
        self.config_namespace = Some(namespace.into());
        self.service_account = Some(service_account.into());
        self
    }

    /// Sets the cluster id this proxy's metadata carried.
    pub fn with_cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    /// Sets the generator name this proxy's metadata selected.
    pub fn with_generator(mut self, name: impl Into<String>) -> Self {
        self.generator_name = Some(name.into());
        self
    }

    /// Forces [`ProxySnapshot::needs_push`] to return `override_value`.
    pub fn with_needs_push_override(mut self, override_value: bool) -> Self {
        self.needs_push_override = Some(override_value);
        self
    }
}

impl ProxySnapshot for StaticProxy {
    fn from_node(node: &Node) -> Self {
        let mut proxy = StaticProxy::new(node.id.clone());
        if let Some(namespace) = metadata_string(node, "NAMESPACE") {
            proxy.config_namespace = Some(namespace);
        }
        if let Some(service_account) = metadata_string(node, "SERVICE_ACCOUNT") {
            proxy.service_account = Some(service_account);
        }
        if let Some(generator) = metadata_string(node, "GENERATOR") {
            proxy.generator_name = Some(generator);
        }
        if !node.cluster.is_empty() {
            proxy.cluster_id = Some(node.cluster.clone());
        }
        if let Some(locality) = node.locality.as_ref().and_then(locality_string) {
            proxy.locality = Some(locality);
        }
        proxy
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref()
    }

    fn config_namespace(&self) -> Option<&str> {
        self.config_namespace.as_deref()
    }

    fn service_account(&self) -> Option<&str> {
        self.service_account.as_deref()
    }

    fn generator_name(&self) -> Option<&str> {
        self.generator_name.as_deref()
    }

    fn locality(&self) -> Option<&str> {
        self.locality.as_deref()
    }

    fn set_proxy_state(&mut self, _ctx: &dyn PushContext) {
        if self.locality.is_none() {
            self.locality = Some("default".to_string());
        }
    }

    fn update_proxy(&mut self, _ctx: &dyn PushContext) {
        if self.locality.is_none() {
            self.locality = Some("default".to_string());
        }
    }

    fn needs_push(&self, _event: &PushRequest) -> bool {
        self.needs_push_override.unwrap_or(true)
    }

    fn push_type_for(&self, _event: &PushRequest) -> PushTypeMask {
        PushTypeMask::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_node_derives_locality_from_node_locality() {
        let node = Node {
            id: "node-1".into(),
            locality: Some(Locality {
                region: "us-east-1".into(),
                zone: "us-east-1a".into(),
                sub_zone: String::new(),
            }),
            ..Default::default()
        };
        let proxy = StaticProxy::from_node(&node);
        assert_eq!(proxy.locality(), Some("us-east-1/us-east-1a"));
    }

    #[test]
    fn set_proxy_state_falls_back_to_default_locality_when_node_carried_none() {
        let node = Node {
            id: "node-1".into(),
            ..Default::default()
        };
        let mut proxy = StaticProxy::from_node(&node);
        assert_eq!(proxy.locality(), None);
        proxy.set_proxy_state(&SimplePushContext::new("v1"));
        assert_eq!(proxy.locality(), Some("default"));
    }
}
