//! Run configuration.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use weft_graph::{OutputCache, Provenance, RunId};

use crate::cache::default_cache;
use crate::merge::MergeStrategy;

/// Selects the output cache a run consults.
#[derive(Clone, Default)]
pub enum CacheSelection {
    /// No cache lookups or writes.
    #[default]
    Disabled,
    /// Resolve to the runner's injected cache, falling back to the
    /// process default; no cache when neither is configured.
    Default,
    /// Use this shared cache reference.
    Shared(Arc<dyn OutputCache>),
}

impl CacheSelection {
    /// Resolves the effective cache for a run.
    pub(crate) fn resolve(&self, injected: Option<&Arc<dyn OutputCache>>) -> Option<Arc<dyn OutputCache>> {
        match self {
            Self::Disabled => None,
            Self::Default => injected.cloned().or_else(default_cache),
            Self::Shared(cache) => Some(Arc::clone(cache)),
        }
    }
}

impl std::fmt::Debug for CacheSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Default => f.write_str("Default"),
            Self::Shared(_) => f.write_str("Shared(..)"),
        }
    }
}

/// Configuration for one graph run.
#[derive(Clone, Debug, Default)]
pub struct RunConfig {
    /// Output cache selection.
    pub cache: CacheSelection,
    /// Parent abort signal; a cancelled parent aborts this run.
    pub parent_signal: Option<CancellationToken>,
    /// Provenance inherited from the caller.
    pub parent_provenance: Provenance,
    /// Strategy merging leaf outputs into the run result.
    pub merge: MergeStrategy,
    /// Explicit run id; a fresh one is generated when absent.
    pub run_id: Option<RunId>,
}

impl RunConfig {
    /// Creates the default configuration: no cache, `named` merge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache selection.
    pub fn with_cache(mut self, cache: CacheSelection) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the parent abort signal.
    pub fn with_parent_signal(mut self, signal: CancellationToken) -> Self {
        self.parent_signal = Some(signal);
        self
    }

    /// Sets the inherited provenance.
    pub fn with_parent_provenance(mut self, provenance: Provenance) -> Self {
        self.parent_provenance = provenance;
        self
    }

    /// Sets the leaf-merge strategy.
    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }

    /// Sets an explicit run id.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryOutputCache;

    #[test]
    fn test_disabled_resolves_to_none() {
        let injected: Arc<dyn OutputCache> = Arc::new(InMemoryOutputCache::new());
        assert!(CacheSelection::Disabled.resolve(Some(&injected)).is_none());
    }

    #[test]
    fn test_shared_resolves_to_reference() {
        let shared: Arc<dyn OutputCache> = Arc::new(InMemoryOutputCache::new());
        let resolved = CacheSelection::Shared(Arc::clone(&shared)).resolve(None);
        assert!(resolved.is_some());
    }

    #[test]
    fn test_default_prefers_injected() {
        let injected: Arc<dyn OutputCache> = Arc::new(InMemoryOutputCache::new());
        assert!(CacheSelection::Default.resolve(Some(&injected)).is_some());
    }

    #[test]
    fn test_builder_methods() {
        let cfg = RunConfig::new()
            .with_merge(MergeStrategy::Last)
            .with_parent_signal(CancellationToken::new());
        assert_eq!(cfg.merge, MergeStrategy::Last);
        assert!(cfg.parent_signal.is_some());
    }
}
