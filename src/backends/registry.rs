//! Backend registry for the configured execution backends

use super::traits::{Availability, Backend, BackendKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of the backends a batch may dispatch to
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any previous one of the same kind
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    /// Get a backend by kind
    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&kind)
    }

    /// Check if a backend kind is registered
    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Registered kinds, local first
    pub fn kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }

    /// Probe every registered backend
    pub async fn availability(&self) -> Availability {
        let mut availability = Availability::default();
        for kind in BackendKind::ALL {
            let available = match self.backends.get(&kind) {
                Some(backend) => backend.is_available().await,
                None => false,
            };
            match kind {
                BackendKind::Local => availability.local = available,
                BackendKind::Remote => availability.remote = available,
            }
        }
        availability
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
