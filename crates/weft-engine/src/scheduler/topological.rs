//! Topological scheduler for reactive runs.

use std::collections::VecDeque;

use async_trait::async_trait;

use weft_graph::{TaskGraph, TaskId};

use super::TaskScheduler;

/// Yields tasks in topological order without regard to runtime
/// readiness.
///
/// Reactive runs execute tasks inline in order, so no waiting is ever
/// needed; completion notifications are a no-op.
pub struct TopologicalScheduler {
    queue: VecDeque<TaskId>,
}

impl TopologicalScheduler {
    /// Creates a scheduler primed with the graph's topological order.
    pub fn new(graph: &TaskGraph) -> Self {
        let mut scheduler = Self {
            queue: VecDeque::new(),
        };
        TaskScheduler::reset(&mut scheduler, graph);
        scheduler
    }
}

#[async_trait]
impl TaskScheduler for TopologicalScheduler {
    fn reset(&mut self, graph: &TaskGraph) {
        self.queue = graph.topological_order().into();
    }

    async fn next_ready(&mut self) -> Option<TaskId> {
        self.queue.pop_front()
    }

    fn on_task_completed(&mut self, _id: &TaskId) {}

    fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use weft_graph::payload::TaskPayload;
    use weft_graph::{ExecutionContext, Task, TaskError, TaskKind, TaskSchema};

    use super::*;

    struct StubKind {
        schema: TaskSchema,
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

    #[tokio::test]
    async fn test_yields_topological_order() {
        let kind = Arc::new(StubKind {
            schema: TaskSchema::default(),
        });
        let mut graph = TaskGraph::new();
        for id in ["a", "b", "c"] {
            graph.add_task(Task::new(id, kind.clone())).expect("add");
        }
        graph.connect("c", "output", "a", "input").expect("c->a");

        let mut scheduler = TopologicalScheduler::new(&graph);
        let mut order = Vec::new();
        while let Some(id) = scheduler.next_ready().await {
            order.push(id.to_string());
        }

        assert_eq!(order, vec!["b", "c", "a"]);
        assert!(!scheduler.has_pending());
    }
}
