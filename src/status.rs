//! The distribution-status collaborator.

/// Reports, per connection and event-type, whether a given configuration
/// version has been observed by that connection — used for convergence
/// accounting even when no wire push was actually owed for a type.
pub trait StatusReporter: Send + Sync + 'static {
    /// Records that `connection_id` has observed `version` for `type_url`,
    /// whether or not a response was actually sent.
    fn register_event(&self, connection_id: &str, type_url: &str, version: &str);
    /// Records that `connection_id` disconnected; events for all
    /// outstanding types should be considered final.
    fn register_disconnect(&self, connection_id: &str);
}

/// Default [`StatusReporter`] that logs at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusReporter;

impl StatusReporter for TracingStatusReporter {
    fn register_event(&self, connection_id: &str, type_url: &str, version: &str) {
        tracing::debug!(connection_id, type_url, version, "status event");
    }

    fn register_disconnect(&self, connection_id: &str) {
        tracing::debug!(connection_id, "status disconnect");
    }
}
