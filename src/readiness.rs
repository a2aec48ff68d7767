//! The server-readiness collaborator.

use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the server is ready to accept new streams. Readiness
/// determination itself (cache warm-up, initial sync with the config
/// store) lives outside this crate; this trait is only the gate
/// [`crate::server::AdsService`] consults before registering a connection.
pub trait ReadinessGate: Send + Sync + 'static {
    /// Returns `true` once the server may accept new streams.
    fn is_ready(&self) -> bool;
}

/// A [`ReadinessGate`] backed by an atomic flag, flippable from outside the
/// request path once warm-up completes.
#[derive(Debug, Default)]
pub struct AtomicReadinessGate(AtomicBool);

impl AtomicReadinessGate {
    /// Creates a gate starting in the given state.
    pub fn new(ready: bool) -> Self {
        AtomicReadinessGate(AtomicBool::new(ready))
    }

    /// Marks the server ready.
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl ReadinessGate for AtomicReadinessGate {
    fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
