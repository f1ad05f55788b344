//! Graph and task error types.

use thiserror::Error;

use crate::dataflow::DataflowId;
use crate::task::TaskId;

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised by graph construction and validation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A task with the same id already exists in the graph.
    #[error("duplicate task id {0}")]
    DuplicateTask(TaskId),

    /// A dataflow with the same id already exists in the graph.
    #[error("duplicate dataflow {0}")]
    DuplicateDataflow(DataflowId),

    /// A dataflow references a task that is not in the graph.
    #[error("dataflow endpoint references missing task {0}")]
    MissingEndpoint(TaskId),

    /// Inserting the dataflow would make the graph cyclic.
    #[error("dataflow {0} would introduce a cycle")]
    CycleDetected(DataflowId),

    /// Task input failed schema validation.
    #[error("invalid input for task {task_id}: {message}")]
    InvalidInput {
        /// ID of the task whose input is invalid.
        task_id: TaskId,
        /// Validation failure message.
        message: String,
    },

    /// A definition references a task type that is not registered.
    #[error("unknown task type {0}")]
    UnknownTaskType(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error produced by a single task execution.
///
/// Task errors are cloneable so they can be mirrored onto outbound
/// dataflows and aggregated into a whole-run error group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task observed the abort signal and stopped cooperatively.
    #[error("task aborted")]
    Aborted,

    /// The task's effective input failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The task's execution failed.
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Creates a generic execution failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Returns the stable kind tag used in error-group entries.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Aborted => "Aborted",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Failed(_) => "TaskFailed",
        }
    }

    /// Returns whether this error is the abort sentinel.
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
