//! Output cache interface.

use async_trait::async_trait;

use crate::payload::TaskPayload;

/// A content-addressed store of task outputs keyed by task type and input.
///
/// Implementations derive a deterministic key from the pair (the engine's
/// in-memory cache uses [`crate::fingerprint::fingerprint`]) and must be
/// safe for concurrent access: the runner shares one cache across
/// concurrently executing tasks and runs without extra serialisation.
#[async_trait]
pub trait OutputCache: Send + Sync {
    /// Looks up the cached output for a task type and input, if any.
    async fn get_output(&self, type_name: &str, input: &TaskPayload) -> Option<TaskPayload>;

    /// Stores the output produced for a task type and input.
    async fn save_output(&self, type_name: &str, input: &TaskPayload, output: &TaskPayload);
}
