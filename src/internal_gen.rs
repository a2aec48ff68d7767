//! The internal-generator collaborator:
//! a debug/xds-over-xds watcher notified of connect/disconnect/NACK.

/// Notified of connection lifecycle events and NACKs, independent of the
/// per-type [`crate::generator::Generator`] used for custom resource types.
pub trait InternalGenerator: Send + Sync + 'static {
    /// A new connection completed its first-request handshake.
    fn on_connect(&self, connection_id: &str, node_id: &str);
    /// A connection's stream terminated.
    fn on_disconnect(&self, connection_id: &str);
    /// A connection NACKed a response for `type_url`.
    fn on_nack(&self, connection_id: &str, type_url: &str, message: &str);
}

/// A no-op [`InternalGenerator`] for servers that don't need one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInternalGenerator;

impl InternalGenerator for NoopInternalGenerator {
    fn on_connect(&self, _connection_id: &str, _node_id: &str) {}
    fn on_disconnect(&self, _connection_id: &str) {}
    fn on_nack(&self, _connection_id: &str, _type_url: &str, _message: &str) {}
}
