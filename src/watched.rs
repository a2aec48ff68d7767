//! Per-(connection, type-url) subscription state and the `shouldRespond` reconciler.

use std::collections::HashSet;
use std::time::Instant;

use crate::proto::DiscoveryRequest;

/// One per (connection, type-url). Tracks what the client last asked for
/// and what the server last sent/had acknowledged.
#[derive(Debug, Clone)]
pub struct WatchedResource {
    /// The type URL this record is for.
    pub type_url: String,
    /// Resource names currently requested (order-insensitive set).
    pub resource_names: HashSet<String>,
    /// The full inbound request that produced the current state, kept for
    /// debug and reconnect reasoning.
    pub last_request: DiscoveryRequest,
    /// Version the client last acknowledged.
    pub version_acked: String,
    /// Nonce the client last acknowledged.
    pub nonce_acked: String,
    /// Version the server last sent.
    pub version_sent: String,
    /// Nonce the server last sent.
    pub nonce_sent: String,
    /// When the server last sent a response for this type.
    pub last_sent: Option<Instant>,
    /// Total payload bytes of the last response sent.
    pub last_size: usize,
}

impl WatchedResource {
    /// Creates a fresh watch from an INIT or RECONNECT request: resource
    /// names and `last_request` are taken from the request, everything the
    /// server has sent/had acknowledged starts empty.
    ///
    /// Also used directly (not via [`classify`]) for CDS/LDS's "first
    /// subscription is unconditional" rule.
    pub fn initial(request: &DiscoveryRequest) -> Self {
        Self::new(request)
    }

    fn new(request: &DiscoveryRequest) -> Self {
        WatchedResource {
            type_url: request.type_url.clone(),
            resource_names: names_set(request),
            last_request: request.clone(),
            version_acked: String::new(),
            nonce_acked: String::new(),
            version_sent: String::new(),
            nonce_sent: String::new(),
            last_sent: None,
            last_size: 0,
        }
    }
}

fn names_set(request: &DiscoveryRequest) -> HashSet<String> {
    request.resource_names.iter().cloned().collect()
}

/// Outcome of classifying an inbound request against the stored
/// [`WatchedResource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// `ErrorDetail` was present: a NACK. No response owed, state untouched.
    Nack,
    /// Empty nonce: a new subscription to this type.
    Init,
    /// Non-empty nonce but no prior watch for this type: the client
    /// reconnected mid-session.
    Reconnect,
    /// Nonce doesn't match what the server last sent: a stale ACK/NACK
    /// racing an in-flight push. Ignored.
    Stale,
    /// Nonce matches and the requested name set is unchanged: a plain ACK.
    AckNoop,
    /// Nonce matches but the requested name set changed: an ACK that also
    /// changes the subscription, so a response is owed.
    ResourceChange,
}

impl Classification {
    /// Whether this classification obliges the caller to compute and send
    /// a response for the type.
    pub fn should_respond(self) -> bool {
        matches!(
            self,
            Classification::Init | Classification::Reconnect | Classification::ResourceChange
        )
    }
}

/// Classifies `request` against `existing` (the current watch for this
/// type-url, if any) and mutates `existing` in place when the
/// classification calls for it. Returns the new watch to
/// install when `existing` is `None` and the classification is INIT or
/// RECONNECT, along with the classification itself.
///
/// `existing` is only ever `Some` for non-NACK classifications that don't
/// create a fresh watch; callers are responsible for inserting the
/// returned watch into the connection's watched-resource table.
pub fn classify(
    request: &DiscoveryRequest,
    existing: Option<&mut WatchedResource>,
) -> (Classification, Option<WatchedResource>) {
    if request.error_detail.is_some() {
        return (Classification::Nack, None);
    }

    if request.response_nonce.is_empty() {
        return (Classification::Init, Some(WatchedResource::new(request)));
    }

    let Some(existing) = existing else {
        return (Classification::Reconnect, Some(WatchedResource::new(request)));
    };

    if request.response_nonce != existing.nonce_sent {
        return (Classification::Stale, None);
    }

    let requested = names_set(request);
    if requested == existing.resource_names {
        existing.version_acked = request.version_info.clone();
        existing.nonce_acked = request.response_nonce.clone();
        existing.last_request = request.clone();
        (Classification::AckNoop, None)
    } else {
        existing.version_acked = request.version_info.clone();
        existing.nonce_acked = request.response_nonce.clone();
        existing.resource_names = requested;
        existing.last_request = request.clone();
        (Classification::ResourceChange, None)
    }
}
