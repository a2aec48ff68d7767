//! The metric-recorder collaborator: a real metrics backend is out of scope
//! for this crate, but the session loop and push dispatcher must call into
//! one regardless.

/// Records the handful of counters the session loop and push dispatcher
/// bump along the way. A production implementation would wire these to a
/// metrics registry; the default here just logs, which is enough to drive
/// and assert on in tests.
pub trait MetricsRecorder: Send + Sync + 'static {
    /// A NACK was received for `type_url` with the given gRPC status code.
    fn reject(&self, type_url: &str, code: i32);
    /// An ACK/NACK carried a nonce that didn't match the last sent nonce.
    fn expired_nonce(&self, type_url: &str);
    /// A send exceeded the send timeout and the stream was terminated.
    fn write_timeout(&self, type_url: &str);
    /// An unexpected transport or internal error occurred.
    fn internal_error(&self, context: &str);
    /// The registry gained or lost a connection at `version`; `delta` is +1 or -1.
    fn client_count(&self, version: &str, delta: i64);
    /// `push_connection` returned an error; the session swallows it and
    /// keeps running, so this counter is the only observable trace.
    fn push_failure(&self, reason: &str);
}

/// Default [`MetricsRecorder`] that emits a `tracing` event per counter,
/// loud enough at connection-lifecycle decision points to debug from logs
/// alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn reject(&self, type_url: &str, code: i32) {
        tracing::warn!(type_url, code, "NACK received");
    }

    fn expired_nonce(&self, type_url: &str) {
        tracing::debug!(type_url, "stale ACK/NACK nonce, ignoring");
    }

    fn write_timeout(&self, type_url: &str) {
        tracing::warn!(type_url, "send timed out, terminating stream");
    }

    fn internal_error(&self, context: &str) {
        tracing::error!(context, "internal error");
    }

    fn client_count(&self, version: &str, delta: i64) {
        tracing::debug!(version, delta, "client count changed");
    }

    fn push_failure(&self, reason: &str) {
        tracing::warn!(reason, "push_connection failed, session continues");
    }
}
