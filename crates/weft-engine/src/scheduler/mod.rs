//! Schedulers deciding which ready task the runner executes next.
//!
//! Two strategies are provided:
//! - [`DependencyScheduler`]: releases a task the moment every
//!   predecessor is satisfied (completed, or streaming with at least one
//!   chunk). Used for full runs.
//! - [`TopologicalScheduler`]: yields the topological order without
//!   regard to runtime readiness. Used for reactive runs.
//!
//! A scheduler is a pure coordinator: it never starts execution, never
//! observes outputs, and is oblivious to cancellation and errors. It is
//! not thread-safe by itself; the runner serialises all calls on its
//! coordinator task.

use async_trait::async_trait;

use weft_graph::{TaskGraph, TaskId};

mod dependency;
mod topological;

pub use dependency::DependencyScheduler;
pub use topological::TopologicalScheduler;

/// The scheduling seam between the runner and a strategy.
#[async_trait]
pub trait TaskScheduler: Send {
    /// Recomputes scheduler state from the graph for a new run.
    fn reset(&mut self, graph: &TaskGraph);

    /// Returns the next ready task, suspending until one becomes ready.
    ///
    /// Returns `None` once every task has been handed out. The returned
    /// future is cancel-safe: dropping it before completion never loses
    /// a task.
    async fn next_ready(&mut self) -> Option<TaskId>;

    /// Notifies the scheduler that a task finished.
    fn on_task_completed(&mut self, id: &TaskId);

    /// Notifies the scheduler that a task began streaming output.
    fn on_streaming_start(&mut self, id: &TaskId) {
        let _ = id;
    }

    /// Notifies the scheduler that a streaming task emitted a chunk.
    fn on_streaming_chunk(&mut self, id: &TaskId) {
        let _ = id;
    }

    /// Returns whether any task has not been handed out yet.
    fn has_pending(&self) -> bool;
}
