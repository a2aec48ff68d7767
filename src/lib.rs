//! Server-side session state machine and push fan-out engine for an
//! Aggregated Discovery Service (ADS): the state-of-the-world xDS variant
//! of the bidirectional-streaming configuration-distribution protocol.
//!
//! This crate owns the protocol state machine — watched-resource
//! reconciliation, the ACK/NACK classification table, the send path, and
//! push fan-out across connections — atop wire types supplied by
//! [`envoy_types`]. The configuration store, the resource generators that
//! compute actual payload bytes, the identity authenticator, and metrics
//! backends are external collaborators; this crate defines the trait shape
//! each one must satisfy and ships one workable default for each.

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod generator;
pub mod identity;
pub mod internal_gen;
pub mod metrics;
pub mod proto;
pub mod proxy;
pub mod push;
pub mod push_queue;
pub mod readiness;
pub mod registry;
pub mod server;
pub mod session;
pub mod status;
pub mod watched;

pub use connection::{Connection, ConnectionId, ConnectionIdAllocator, ResourceKey};
pub use error::Error;
pub use proxy::{ConfigKey, Event, ProxySnapshot, PushContext, PushRequest, PushTypeMask, SimplePushContext, StaticProxy};
pub use registry::ConnectionRegistry;
pub use server::AdsService;
pub use session::SessionDeps;
