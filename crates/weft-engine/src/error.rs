//! Engine error types and whole-run error aggregation.

use thiserror::Error;

use weft_graph::{GraphError, TaskError};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the execution layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A graph-model operation failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A run was started while another run is in progress on the same
    /// runner.
    #[error("a run is already in progress for this graph")]
    AlreadyRunning,

    /// Invalid run configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// One or more tasks failed, or the run was aborted.
    #[error(transparent)]
    Group(#[from] ErrorGroup),
}

/// One aggregated failure inside an [`ErrorGroup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Task id the failure belongs to, or `"*"` for the whole run.
    pub key: String,
    /// The underlying task error.
    pub error: TaskError,
}

impl ErrorEntry {
    /// Creates an entry keyed by a task id.
    pub fn new(key: impl Into<String>, error: TaskError) -> Self {
        Self {
            key: key.into(),
            error,
        }
    }

    /// Creates the whole-run abort entry.
    pub fn aborted() -> Self {
        Self::new("*", TaskError::Aborted)
    }

    /// Returns the stable kind tag of the underlying error.
    pub const fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

/// Aggregation of the failures of one run.
///
/// A failed run surfaces exactly one group, holding one entry per failed
/// task (in the order the runner observed them) and, when the run was
/// cancelled, the whole-run abort entry keyed `"*"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorGroup {
    entries: Vec<ErrorEntry>,
}

impl ErrorGroup {
    /// Creates a group from its entries.
    pub fn new(entries: Vec<ErrorEntry>) -> Self {
        Self { entries }
    }

    /// Returns all entries, most recently observed last.
    pub fn errors(&self) -> &[ErrorEntry] {
        &self.entries
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the group has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns whether the run was cancelled.
    pub fn has_abort_error(&self) -> bool {
        self.entries.iter().any(|entry| entry.error.is_abort())
    }

    /// Returns the entry recorded under the given key, if any.
    pub fn error_by_key(&self, key: &str) -> Option<&ErrorEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }
}

impl std::fmt::Display for ErrorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run failed with {} error(s)", self.entries.len())?;
        for entry in &self.entries {
            write!(f, "; {}: {}", entry.key, entry.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorGroup {}
