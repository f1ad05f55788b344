//! Typed pub/sub for task, dataflow and graph lifecycle events.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::dataflow::DataflowId;
use crate::error::TaskError;
use crate::task::{RunId, TaskId};

/// Default buffer capacity for event channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A typed broadcast bus for lifecycle events.
///
/// Emission never blocks and never fails: events emitted with no active
/// subscribers are dropped, and a subscriber that falls behind the buffer
/// capacity loses the oldest events (standard broadcast-channel lagging).
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Creates a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a bus with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Emits an event to all current subscribers.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// Returns the number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Lifecycle events emitted by a single task.
#[derive(Clone, Debug)]
pub enum TaskEvent {
    /// The task began processing.
    Start {
        /// Task that started.
        task_id: TaskId,
    },
    /// The task reported progress while processing.
    Progress {
        /// Task reporting progress.
        task_id: TaskId,
        /// Progress in `[0, 100]`.
        progress: f32,
        /// Optional progress message.
        message: Option<String>,
        /// Optional structured details.
        details: Option<Value>,
    },
    /// The task completed successfully.
    Complete {
        /// Task that completed.
        task_id: TaskId,
    },
    /// The task failed.
    Error {
        /// Task that failed.
        task_id: TaskId,
        /// The failure.
        error: TaskError,
    },
    /// Cancellation was requested for the task.
    Abort {
        /// Task being aborted.
        task_id: TaskId,
    },
    /// The task was reset to pending.
    Reset {
        /// Task that was reset.
        task_id: TaskId,
    },
    /// The task was skipped without executing.
    Skipped {
        /// Task that was skipped.
        task_id: TaskId,
    },
    /// A compound task rebuilt its sub-graph.
    Regenerate {
        /// Compound task that regenerated.
        task_id: TaskId,
    },
}

/// Lifecycle events mirrored onto a dataflow from its source task.
#[derive(Clone, Debug)]
pub enum DataflowEvent {
    /// The source task began processing.
    Start {
        /// Dataflow whose source started.
        dataflow_id: DataflowId,
    },
    /// The source task completed.
    Complete {
        /// Dataflow whose source completed.
        dataflow_id: DataflowId,
    },
    /// The source task is aborting.
    Abort {
        /// Dataflow whose source is aborting.
        dataflow_id: DataflowId,
    },
    /// The dataflow was cleared for a new run.
    Reset {
        /// Dataflow that was reset.
        dataflow_id: DataflowId,
    },
    /// The source task failed.
    Error {
        /// Dataflow whose source failed.
        dataflow_id: DataflowId,
        /// The propagated failure.
        error: TaskError,
    },
    /// The source task was skipped.
    Skipped {
        /// Dataflow whose source was skipped.
        dataflow_id: DataflowId,
    },
}

/// Structural and run-lifecycle events emitted on a graph.
#[derive(Clone, Debug)]
pub enum GraphEvent {
    /// A task was added to the graph.
    TaskAdded {
        /// Added task.
        task_id: TaskId,
    },
    /// A task was removed from the graph.
    TaskRemoved {
        /// Removed task.
        task_id: TaskId,
    },
    /// A dataflow was added to the graph.
    DataflowAdded {
        /// Added dataflow.
        dataflow_id: DataflowId,
    },
    /// A dataflow was removed from the graph.
    DataflowRemoved {
        /// Removed dataflow.
        dataflow_id: DataflowId,
    },
    /// A compound task in the graph rebuilt its sub-graph.
    Regenerated {
        /// Compound task whose sub-graph was rebuilt.
        task_id: TaskId,
    },
    /// A run started on the graph.
    RunStarted {
        /// Run identifier.
        run_id: RunId,
    },
    /// A run finished successfully.
    RunCompleted {
        /// Run identifier.
        run_id: RunId,
    },
    /// A run failed; entries pair task keys with error messages.
    RunFailed {
        /// Run identifier.
        run_id: RunId,
        /// `(key, message)` per aggregated error.
        errors: Vec<(String, String)>,
    },
    /// A run was aborted.
    RunAborted {
        /// Run identifier.
        run_id: RunId,
    },
    /// Aggregate run progress changed.
    Progress {
        /// Run identifier.
        run_id: RunId,
        /// Fraction of tasks completed, in `[0, 100]`.
        progress: f32,
        /// Human-readable progress summary.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let bus: EventBus<TaskEvent> = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(TaskEvent::Start {
            task_id: TaskId::from("t"),
        });

        let event = rx.recv().await.expect("event delivered");
        assert!(matches!(event, TaskEvent::Start { task_id } if task_id.as_str() == "t"));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus: EventBus<TaskEvent> = EventBus::new();
        bus.emit(TaskEvent::Complete {
            task_id: TaskId::from("t"),
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_clone_shares_channel() {
        let bus: EventBus<TaskEvent> = EventBus::new();
        let clone = bus.clone();
        let mut rx = bus.subscribe();

        clone.emit(TaskEvent::Reset {
            task_id: TaskId::from("t"),
        });

        assert!(rx.recv().await.is_ok());
    }
}
