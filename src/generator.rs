//! The pluggable resource generator: the external component
//! that produces a payload for one (proxy, type-url, push-context) triple
//! when a connection's metadata selects a named generator, or for any
//! non-built-in type-url regardless of selection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::GeneratorError;
use crate::proto::DiscoveryResponse;
use crate::proxy::{ProxySnapshot, PushContext};

/// Produces the response for one watched type against one proxy, or `None`
/// if nothing is owed for that type right now.
pub trait Generator: Send + Sync + 'static {
    /// Computes the response for `type_url`/`names` against `ctx`.
    fn generate(
        &self,
        proxy: &dyn ProxySnapshot,
        type_url: &str,
        ctx: &dyn PushContext,
        names: &[String],
    ) -> Result<Option<DiscoveryResponse>, GeneratorError>;
}

/// A server-wide, name-keyed table of generators: a connection's generator
/// is selected by name out of this registry rather than wired in directly.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: RwLock<HashMap<String, Arc<dyn Generator>>>,
}

impl GeneratorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `generator` under `name`, replacing any prior entry.
    pub fn register(&self, name: impl Into<String>, generator: Arc<dyn Generator>) {
        self.generators.write().unwrap().insert(name.into(), generator);
    }

    /// Looks up the generator registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Generator>> {
        self.generators.read().unwrap().get(name).cloned()
    }
}
