//! Dependency-based scheduler with streaming readiness.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Notify;

use weft_graph::{TaskGraph, TaskId};

use super::TaskScheduler;

/// Releases tasks the moment their predecessors are satisfied.
///
/// A task is ready when every predecessor is either completed, or is
/// streaming and has emitted at least one chunk. When no pending task is
/// ready, [`TaskScheduler::next_ready`] suspends on a single-slot waiter
/// that completion and streaming notifications wake.
pub struct DependencyScheduler {
    /// Task ids in insertion order, for deterministic selection.
    order: Vec<TaskId>,
    predecessors: HashMap<TaskId, Vec<TaskId>>,
    pending: HashSet<TaskId>,
    completed: HashSet<TaskId>,
    streaming: HashSet<TaskId>,
    streaming_with_chunks: HashSet<TaskId>,
    waiter: Notify,
}

impl DependencyScheduler {
    /// Creates a scheduler primed with the graph's tasks.
    pub fn new(graph: &TaskGraph) -> Self {
        let mut scheduler = Self {
            order: Vec::new(),
            predecessors: HashMap::new(),
            pending: HashSet::new(),
            completed: HashSet::new(),
            streaming: HashSet::new(),
            streaming_with_chunks: HashSet::new(),
            waiter: Notify::new(),
        };
        TaskScheduler::reset(&mut scheduler, graph);
        scheduler
    }

    fn is_satisfied(&self, predecessor: &TaskId) -> bool {
        self.completed.contains(predecessor)
            || (self.streaming.contains(predecessor)
                && self.streaming_with_chunks.contains(predecessor))
    }

    fn find_ready(&self) -> Option<TaskId> {
        self.order
            .iter()
            .find(|id| {
                self.pending.contains(*id)
                    && self
                        .predecessors
                        .get(*id)
                        .is_none_or(|preds| preds.iter().all(|pred| self.is_satisfied(pred)))
            })
            .cloned()
    }
}

#[async_trait]
impl TaskScheduler for DependencyScheduler {
    fn reset(&mut self, graph: &TaskGraph) {
        self.order = graph.task_ids().collect();
        self.predecessors = self
            .order
            .iter()
            .map(|id| (id.clone(), graph.predecessors(id)))
            .collect();
        self.pending = self.order.iter().cloned().collect();
        self.completed.clear();
        self.streaming.clear();
        self.streaming_with_chunks.clear();
    }

    async fn next_ready(&mut self) -> Option<TaskId> {
        loop {
            if self.pending.is_empty() {
                return None;
            }
            if let Some(id) = self.find_ready() {
                self.pending.remove(&id);
                return Some(id);
            }
            // Nothing is ready; park on the waiter until a completion or
            // streaming notification arrives. No state was mutated, so
            // cancelling here is safe.
            self.waiter.notified().await;
        }
    }

    fn on_task_completed(&mut self, id: &TaskId) {
        self.completed.insert(id.clone());
        self.streaming.remove(id);
        self.streaming_with_chunks.remove(id);
        self.waiter.notify_one();
    }

    fn on_streaming_start(&mut self, id: &TaskId) {
        self.streaming.insert(id.clone());
        self.waiter.notify_one();
    }

    fn on_streaming_chunk(&mut self, id: &TaskId) {
        if self.streaming.contains(id) {
            self.streaming_with_chunks.insert(id.clone());
        }
        self.waiter.notify_one();
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use weft_graph::payload::TaskPayload;
    use weft_graph::{
        ExecutionContext, PortSchema, PortType, Task, TaskError, TaskKind, TaskSchema,
    };

    use super::*;

    struct StubKind {
        schema: TaskSchema,
    }

    impl StubKind {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                schema: TaskSchema::new(
                    vec![PortSchema::new("input", PortType::Any).with_default(json!(null))],
                    vec![PortSchema::new("output", PortType::Any)],
                ),
            })
        }
    }

    #[async_trait]
    impl TaskKind for StubKind {
        fn type_name(&self) -> &str {
            "Stub"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            _input: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            Ok(TaskPayload::new())
        }
    }

    fn chain_graph() -> TaskGraph {
        let kind = StubKind::shared();
        let mut graph = TaskGraph::new();
        for id in ["a", "b", "c"] {
            graph.add_task(Task::new(id, kind.clone())).expect("add");
        }
        graph.connect("a", "output", "b", "input").expect("a->b");
        graph.connect("b", "output", "c", "input").expect("b->c");
        graph
    }

    #[tokio::test]
    async fn test_releases_in_dependency_order() {
        let graph = chain_graph();
        let mut scheduler = DependencyScheduler::new(&graph);

        let first = scheduler.next_ready().await.expect("ready");
        assert_eq!(first.as_str(), "a");

        scheduler.on_task_completed(&first);
        let second = scheduler.next_ready().await.expect("ready");
        assert_eq!(second.as_str(), "b");

        scheduler.on_task_completed(&second);
        let third = scheduler.next_ready().await.expect("ready");
        assert_eq!(third.as_str(), "c");

        scheduler.on_task_completed(&third);
        assert!(scheduler.next_ready().await.is_none());
        assert!(!scheduler.has_pending());
    }

    #[tokio::test]
    async fn test_waits_until_predecessor_completes() {
        let graph = chain_graph();
        let mut scheduler = DependencyScheduler::new(&graph);

        let first = scheduler.next_ready().await.expect("ready");

        // "b" is not ready yet; next_ready must suspend rather than
        // return it.
        let waited = tokio::time::timeout(Duration::from_millis(20), scheduler.next_ready()).await;
        assert!(waited.is_err());

        scheduler.on_task_completed(&first);
        let second = scheduler.next_ready().await.expect("ready");
        assert_eq!(second.as_str(), "b");
    }

    #[tokio::test]
    async fn test_streaming_with_chunks_satisfies_successors() {
        let graph = chain_graph();
        let mut scheduler = DependencyScheduler::new(&graph);

        let first = scheduler.next_ready().await.expect("ready");
        assert_eq!(first.as_str(), "a");

        // Streaming alone is not enough.
        scheduler.on_streaming_start(&first);
        let waited = tokio::time::timeout(Duration::from_millis(20), scheduler.next_ready()).await;
        assert!(waited.is_err());

        // The first chunk makes the successor ready.
        scheduler.on_streaming_chunk(&first);
        let second = scheduler.next_ready().await.expect("ready");
        assert_eq!(second.as_str(), "b");
    }

    #[tokio::test]
    async fn test_independent_tasks_release_in_insertion_order() {
        let kind = StubKind::shared();
        let mut graph = TaskGraph::new();
        for id in ["task1", "task2"] {
            graph.add_task(Task::new(id, kind.clone())).expect("add");
        }

        let mut scheduler = DependencyScheduler::new(&graph);
        let first = scheduler.next_ready().await.expect("ready");
        let second = scheduler.next_ready().await.expect("ready");
        assert_eq!(first.as_str(), "task1");
        assert_eq!(second.as_str(), "task2");
    }

    #[tokio::test]
    async fn test_release_order_survives_remove_then_add() {
        let kind = StubKind::shared();
        let mut graph = TaskGraph::new();
        for id in ["task1", "task2", "task3"] {
            graph.add_task(Task::new(id, kind.clone())).expect("add");
        }

        // "task4" lands in the graph slot freed by "task2" but was added
        // last, so it must also release last.
        graph.remove_task(&TaskId::from("task2"));
        graph.add_task(Task::new("task4", kind)).expect("add task4");

        let mut scheduler = DependencyScheduler::new(&graph);
        let mut released = Vec::new();
        while let Some(id) = scheduler.next_ready().await {
            scheduler.on_task_completed(&id);
            released.push(id.to_string());
        }
        assert_eq!(released, vec!["task1", "task3", "task4"]);
    }
}
