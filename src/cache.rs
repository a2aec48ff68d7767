//! The shared response-cache collaborator: invalidated by the
//! push dispatcher before a change batch fans out, consulted by whatever
//! computes per-type responses (out of scope here; this crate only owns
//! clearing it).

use std::collections::HashSet;
use std::sync::Mutex;

use crate::connection::ResourceKey;

/// Invalidated by [`crate::push::ads_push_all`] before fan-out begins.
pub trait ResponseCache: Send + Sync + 'static {
    /// Drops every cached entry.
    fn clear_all(&self);
    /// Drops only the named entries.
    fn clear(&self, keys: &[ResourceKey]);
}

/// An in-memory set of cached keys, cleared as directed. Real response
/// bytes live with the (out-of-scope) resource generators; this cache only
/// tracks *which* keys are considered fresh, which is sufficient to
/// exercise and assert the clearing discipline against a push fan-out.
#[derive(Debug, Default)]
pub struct InMemoryResponseCache {
    fresh: Mutex<HashSet<ResourceKey>>,
}

impl InMemoryResponseCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` as freshly cached; used by tests to populate state
    /// before asserting on what `clear`/`clear_all` remove.
    pub fn mark_fresh(&self, key: ResourceKey) {
        self.fresh.lock().unwrap().insert(key);
    }

    /// Returns whether `key` is currently considered fresh.
    pub fn is_fresh(&self, key: &ResourceKey) -> bool {
        self.fresh.lock().unwrap().contains(key)
    }

    /// The number of entries currently cached.
    pub fn len(&self) -> usize {
        self.fresh.lock().unwrap().len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for InMemoryResponseCache {
    fn clear_all(&self) {
        self.fresh.lock().unwrap().clear();
    }

    fn clear(&self, keys: &[ResourceKey]) {
        let mut fresh = self.fresh.lock().unwrap();
        for key in keys {
            fresh.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, type_url: &str) -> ResourceKey {
        ResourceKey {
            name: name.to_string(),
            type_url: type_url.to_string(),
        }
    }

    #[test]
    fn clear_all_then_selective_clear_only_touches_named_entries() {
        let cache = InMemoryResponseCache::new();
        cache.mark_fresh(key("a", "cluster"));
        cache.mark_fresh(key("b", "cluster"));

        cache.clear_all();
        assert!(cache.is_empty());

        cache.mark_fresh(key("a", "cluster"));
        cache.mark_fresh(key("b", "cluster"));
        cache.clear(&[key("a", "cluster")]);

        assert!(!cache.is_fresh(&key("a", "cluster")));
        assert!(cache.is_fresh(&key("b", "cluster")));
    }
}
