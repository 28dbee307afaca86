//! Source registry lookup
//!
//! The registry owns source records; the streaming core only reads them.
//! Persistence (create, update, delete through the dashboard API) lives
//! behind this trait in the embedding application.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::types::{SourceConfig, SourceId};
use crate::{Result, StreamError};

/// Read-only view of the configured sources
#[async_trait::async_trait]
pub trait SourceRegistry: Send + Sync + 'static {
    /// Look up a source by id
    ///
    /// Returns:
    /// - `Ok(config)` - Snapshot of the source record at lookup time
    /// - `Err(StreamError::SourceNotFound)` - No such source
    async fn lookup(&self, source_id: &SourceId) -> Result<Arc<SourceConfig>>;
}

/// Registry backed by an in-process map
///
/// Used for sources declared in the configuration file and in tests.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    sources: RwLock<HashMap<SourceId, Arc<SourceConfig>>>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the given sources
    pub fn from_sources(sources: impl IntoIterator<Item = SourceConfig>) -> Self {
        let registry = Self::new();
        for source in sources {
            registry.insert(source);
        }
        registry
    }

    /// Add or replace a source record
    ///
    /// Sessions already streaming keep the snapshot they were started with.
    pub fn insert(&self, source: SourceConfig) {
        debug!(source_id = %source.id, kind = %source.kind, "Source registered");
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.insert(source.id.clone(), Arc::new(source));
    }

    /// Remove a source record
    pub fn remove(&self, source_id: &SourceId) -> Option<Arc<SourceConfig>> {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.remove(source_id)
    }

    /// All registered sources, sorted by id
    pub fn list(&self) -> Vec<Arc<SourceConfig>> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = sources.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Number of registered sources
    pub fn len(&self) -> usize {
        self.sources.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no source is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl SourceRegistry for InMemoryRegistry {
    async fn lookup(&self, source_id: &SourceId) -> Result<Arc<SourceConfig>> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        sources
            .get(source_id)
            .cloned()
            .ok_or_else(|| StreamError::source_not_found(source_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;

    #[tokio::test]
    async fn lookup_returns_snapshot() {
        let registry = InMemoryRegistry::from_sources([
            SourceConfig::new("cam1", SourceKind::TestPattern, 30.0),
            SourceConfig::new("cam2", SourceKind::TestPattern, 15.0),
        ]);

        let before = registry.lookup(&SourceId::new("cam1")).await.unwrap();
        registry.insert(SourceConfig::new("cam1", SourceKind::TestPattern, 10.0));
        let after = registry.lookup(&SourceId::new("cam1")).await.unwrap();

        assert_eq!(before.frame_rate, 30.0);
        assert_eq!(after.frame_rate, 10.0);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let registry = InMemoryRegistry::new();
        let err = registry.lookup(&SourceId::new("missing")).await.unwrap_err();
        assert!(matches!(err, StreamError::SourceNotFound { .. }));

        registry.insert(SourceConfig::new("gone", SourceKind::TestPattern, 1.0));
        registry.remove(&SourceId::new("gone"));
        assert!(registry.lookup(&SourceId::new("gone")).await.is_err());
        assert!(registry.is_empty());
    }
}
