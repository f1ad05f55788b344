//! In-memory output cache and the process-default cache registry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::RwLock;

use weft_graph::fingerprint::fingerprint;
use weft_graph::{OutputCache, TaskPayload};

/// Tracing target for cache operations.
const TRACING_TARGET: &str = "weft_engine::cache";

/// Process-wide default cache, configured once at startup.
static DEFAULT_CACHE: OnceLock<Arc<dyn OutputCache>> = OnceLock::new();

/// Installs the process-default output cache.
///
/// Runs configured with [`CacheSelection::Default`](crate::config::CacheSelection)
/// resolve to this cache. The default can be set once; returns whether
/// this call installed it.
pub fn set_default_cache(cache: Arc<dyn OutputCache>) -> bool {
    DEFAULT_CACHE.set(cache).is_ok()
}

/// Returns the process-default output cache, if one was installed.
pub fn default_cache() -> Option<Arc<dyn OutputCache>> {
    DEFAULT_CACHE.get().cloned()
}

/// A concurrent in-memory output cache keyed by task type and input
/// fingerprint.
#[derive(Debug, Default)]
pub struct InMemoryOutputCache {
    entries: RwLock<HashMap<(String, String), TaskPayload>>,
}

impl InMemoryOutputCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of cached outputs.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Removes all cached outputs.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl OutputCache for InMemoryOutputCache {
    async fn get_output(&self, type_name: &str, input: &TaskPayload) -> Option<TaskPayload> {
        let key = match fingerprint(type_name, input) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_type = type_name,
                    error = %err,
                    "Failed to fingerprint cache lookup"
                );
                return None;
            }
        };
        self.entries
            .read()
            .await
            .get(&(type_name.to_owned(), key))
            .cloned()
    }

    async fn save_output(&self, type_name: &str, input: &TaskPayload, output: &TaskPayload) {
        let key = match fingerprint(type_name, input) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_type = type_name,
                    error = %err,
                    "Failed to fingerprint cache write"
                );
                return;
            }
        };
        self.entries
            .write()
            .await
            .insert((type_name.to_owned(), key), output.clone());
    }
}
