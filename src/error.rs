//! Error types for the ADS session and push-fan-out core.

use tonic::Status;

/// Errors that terminate an ADS session, returned up to the session loop.
///
/// Each variant maps to a row of the error taxonomy: protocol-malformed
/// first requests, authorization failures, and send-deadline overruns all
/// terminate the stream with an explicit status; transport errors that are
/// already expected (EOF, cancellation, client disconnect) are handled
/// before they ever reach this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The first request on a stream carried no node id.
    #[error("first request is missing a node id")]
    MissingNodeId,

    /// The server has not yet reached readiness (caches not yet loaded);
    /// the stream is rejected before a connection is registered.
    #[error("server is not ready to accept streams yet")]
    NotReady,

    /// None of the peer's identities matched the proxy's expected
    /// (namespace, service-account) pair.
    #[error("peer identity does not authorize node {node_id}")]
    Unauthorized {
        /// The node id the peer claimed.
        node_id: String,
    },

    /// The send timeout (default 5s) elapsed before the response was
    /// written to the stream.
    #[error("send timed out for type {type_url}")]
    SendTimeout {
        /// The type URL of the response that was abandoned.
        type_url: String,
    },

    /// An unexpected transport error (not EOF/cancelled/client-disconnected).
    #[error("transport error: {0}")]
    Transport(#[from] Status),

    /// The per-connection push handler failed. This does not by itself
    /// terminate the session with an error — the session loop observes it,
    /// bumps a metric, and returns success so the peer reconnects.
    #[error("push computation failed: {0}")]
    Push(String),
}

impl Error {
    /// Maps this error onto the gRPC status returned to the peer.
    pub fn into_status(self) -> Status {
        match self {
            Error::MissingNodeId => Status::invalid_argument(self.to_string()),
            Error::NotReady => Status::unavailable(self.to_string()),
            Error::Unauthorized { .. } => Status::permission_denied(self.to_string()),
            Error::SendTimeout { .. } => Status::deadline_exceeded(self.to_string()),
            Error::Transport(status) => status,
            Error::Push(msg) => Status::internal(msg),
        }
    }
}

/// Returns `true` if `status` is one of the "quiet" transport errors that
/// the session loop terminates on silently (no internal-error metric, no
/// warning log): client EOF, cancellation, deadline exceeded, or the
/// well-known "client disconnected" `UNAVAILABLE` message.
pub fn is_expected_transport_error(status: &Status) -> bool {
    use tonic::Code;
    match status.code() {
        Code::Cancelled | Code::DeadlineExceeded => true,
        Code::Unavailable => status.message().contains("client disconnected"),
        _ => false,
    }
}

/// Error returned by a [`crate::generator::Generator`].
#[derive(Debug, thiserror::Error)]
#[error("generator error for {type_url}: {message}")]
pub struct GeneratorError {
    /// The type URL the generator was asked to produce.
    pub type_url: String,
    /// A human-readable description of the failure.
    pub message: String,
}
