//! Tool backends
//!
//! A backend is one server exposing tools over the `tools/list` /
//! `tools/call` contract. The registry maps server ids to backends; the
//! plan executor dispatches each step to the backend its `server_id`
//! names.

pub mod builtin;
pub mod http;

pub use builtin::BuiltinBackend;
pub use http::HttpToolBackend;

use sdk::backend::ToolBackend;
use std::sync::Arc;

/// Registry of available tool backends, keyed by server id
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn ToolBackend>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend. Last registration wins on server id collision.
    pub fn register(&mut self, backend: Arc<dyn ToolBackend>) {
        self.backends.retain(|b| b.server_id() != backend.server_id());
        self.backends.push(backend);
    }

    /// Look up a backend by server id
    pub fn get(&self, server_id: i64) -> Option<Arc<dyn ToolBackend>> {
        self.backends
            .iter()
            .find(|b| b.server_id() == server_id)
            .map(Arc::clone)
    }

    /// All registered backends
    pub fn all(&self) -> &[Arc<dyn ToolBackend>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lookup_and_replace() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(BuiltinBackend::new()));
        assert!(registry.get(0).is_some());
        assert!(registry.get(1).is_none());

        // Re-registering the same server id replaces the old backend
        registry.register(Arc::new(BuiltinBackend::new()));
        assert_eq!(registry.all().len(), 1);
    }
}
