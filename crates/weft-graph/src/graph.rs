//! Acyclic task graph container.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

use crate::dataflow::{Dataflow, DataflowId};
use crate::error::{GraphError, GraphResult};
use crate::events::{EventBus, GraphEvent};
use crate::task::{Task, TaskId};

/// Tracing target for graph mutations.
const TRACING_TARGET: &str = "weft_graph::graph";

/// An ordered collection of tasks and dataflows forming a DAG.
///
/// Internally uses petgraph's `StableDiGraph` (stable indices keep the
/// id maps valid across removals) with identity indices for constant-time
/// lookups, the insertion acyclicity invariant enforced on every edge
/// insertion. Chronological insertion order is tracked separately:
/// `StableDiGraph` reuses freed slots after a removal, so index order
/// stops reflecting insertion order once anything has been removed.
///
/// Cloning a `TaskGraph` copies the structure but shares the task and
/// dataflow records (and the event bus): a clone is a handle over the
/// same live run state, which is how sub-graph handles are passed to
/// compound executions.
#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    graph: StableDiGraph<Arc<Task>, Arc<Dataflow>>,
    task_indices: HashMap<TaskId, NodeIndex>,
    index_to_id: HashMap<NodeIndex, TaskId>,
    dataflow_indices: HashMap<DataflowId, EdgeIndex>,
    /// Task ids in the order they were added.
    task_order: Vec<TaskId>,
    /// Dataflow ids in the order they were added.
    dataflow_order: Vec<DataflowId>,
    events: EventBus<GraphEvent>,
}

impl TaskGraph {
    /// Creates a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of dataflows in the graph.
    pub fn dataflow_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns the event bus for structural and run lifecycle events.
    pub fn events(&self) -> &EventBus<GraphEvent> {
        &self.events
    }

    /// Adds a task to the graph.
    ///
    /// Fails with [`GraphError::DuplicateTask`] when the id is taken.
    pub fn add_task(&mut self, task: Task) -> GraphResult<Arc<Task>> {
        self.add_task_handle(Arc::new(task))
    }

    /// Adds an already shared task record to the graph.
    pub fn add_task_handle(&mut self, task: Arc<Task>) -> GraphResult<Arc<Task>> {
        let id = task.id().clone();
        if self.task_indices.contains_key(&id) {
            return Err(GraphError::DuplicateTask(id));
        }

        let index = self.graph.add_node(Arc::clone(&task));
        self.task_indices.insert(id.clone(), index);
        self.index_to_id.insert(index, id.clone());
        self.task_order.push(id.clone());

        tracing::trace!(target: TRACING_TARGET, task_id = %id, "Task added");
        self.events.emit(GraphEvent::TaskAdded { task_id: id });
        Ok(task)
    }

    /// Removes a task and all its incident dataflows.
    pub fn remove_task(&mut self, id: &TaskId) -> Option<Arc<Task>> {
        let index = self.task_indices.remove(id)?;
        self.index_to_id.remove(&index);
        self.task_order.retain(|existing| existing != id);

        let incident: Vec<DataflowId> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .chain(self.graph.edges_directed(index, Direction::Outgoing))
            .map(|edge| edge.weight().id().clone())
            .collect();
        for dataflow_id in incident {
            self.remove_dataflow(&dataflow_id);
        }

        let task = self.graph.remove_node(index);
        self.events.emit(GraphEvent::TaskRemoved {
            task_id: id.clone(),
        });
        task
    }

    /// Returns the task with the given id, if present.
    pub fn task(&self, id: &TaskId) -> Option<Arc<Task>> {
        let index = self.task_indices.get(id)?;
        self.graph.node_weight(*index).map(Arc::clone)
    }

    /// Returns whether a task with the given id exists.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_indices.contains_key(id)
    }

    /// Returns all tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = Arc<Task>> + '_ {
        self.task_order.iter().filter_map(|id| self.task(id))
    }

    /// Returns all task ids in insertion order.
    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.task_order.iter().cloned()
    }

    /// Adds a dataflow between two task ports.
    ///
    /// Fails with [`GraphError::MissingEndpoint`] when either endpoint is
    /// absent, [`GraphError::DuplicateDataflow`] on an identical id, and
    /// [`GraphError::CycleDetected`] when the insertion would make the
    /// graph cyclic. A failed insertion leaves the graph untouched.
    pub fn add_dataflow(&mut self, dataflow: Dataflow) -> GraphResult<Arc<Dataflow>> {
        let source = *self
            .task_indices
            .get(dataflow.source_task_id())
            .ok_or_else(|| GraphError::MissingEndpoint(dataflow.source_task_id().clone()))?;
        let target = *self
            .task_indices
            .get(dataflow.target_task_id())
            .ok_or_else(|| GraphError::MissingEndpoint(dataflow.target_task_id().clone()))?;

        let id = dataflow.id().clone();
        if self.dataflow_indices.contains_key(&id) {
            return Err(GraphError::DuplicateDataflow(id));
        }

        // Reachability target -> source means the new edge would close a
        // cycle; checked before any mutation.
        if has_path_connecting(&self.graph, target, source, None) {
            return Err(GraphError::CycleDetected(id));
        }

        let dataflow = Arc::new(dataflow);
        let index = self.graph.add_edge(source, target, Arc::clone(&dataflow));
        self.dataflow_indices.insert(id.clone(), index);
        self.dataflow_order.push(id.clone());

        tracing::trace!(target: TRACING_TARGET, dataflow_id = %id, "Dataflow added");
        self.events.emit(GraphEvent::DataflowAdded { dataflow_id: id });
        Ok(dataflow)
    }

    /// Connects two tasks with a new dataflow.
    pub fn connect(
        &mut self,
        source_task_id: impl Into<TaskId>,
        source_port_id: impl Into<String>,
        target_task_id: impl Into<TaskId>,
        target_port_id: impl Into<String>,
    ) -> GraphResult<Arc<Dataflow>> {
        self.add_dataflow(Dataflow::new(
            source_task_id,
            source_port_id,
            target_task_id,
            target_port_id,
        ))
    }

    /// Removes a dataflow by id.
    pub fn remove_dataflow(&mut self, id: &DataflowId) -> Option<Arc<Dataflow>> {
        let index = self.dataflow_indices.remove(id)?;
        self.dataflow_order.retain(|existing| existing != id);
        let dataflow = self.graph.remove_edge(index);
        self.events.emit(GraphEvent::DataflowRemoved {
            dataflow_id: id.clone(),
        });
        dataflow
    }

    /// Returns the dataflow with the given id, if present.
    pub fn dataflow(&self, id: &DataflowId) -> Option<Arc<Dataflow>> {
        let index = self.dataflow_indices.get(id)?;
        self.graph.edge_weight(*index).map(Arc::clone)
    }

    /// Returns all dataflows in insertion order.
    pub fn dataflows(&self) -> Vec<Arc<Dataflow>> {
        self.dataflow_order
            .iter()
            .filter_map(|id| self.dataflow(id))
            .collect()
    }

    /// Returns the dataflows targeting a task, in insertion order.
    pub fn in_dataflows(&self, id: &TaskId) -> Vec<Arc<Dataflow>> {
        self.directed_dataflows(id, Direction::Incoming)
    }

    /// Returns the dataflows originating from a task, in insertion order.
    pub fn out_dataflows(&self, id: &TaskId) -> Vec<Arc<Dataflow>> {
        self.directed_dataflows(id, Direction::Outgoing)
    }

    fn directed_dataflows(&self, id: &TaskId, direction: Direction) -> Vec<Arc<Dataflow>> {
        let Some(index) = self.task_indices.get(id) else {
            return Vec::new();
        };
        let incident: HashSet<DataflowId> = self
            .graph
            .edges_directed(*index, direction)
            .map(|edge| edge.weight().id().clone())
            .collect();
        self.dataflow_order
            .iter()
            .filter(|dataflow_id| incident.contains(dataflow_id))
            .filter_map(|dataflow_id| self.dataflow(dataflow_id))
            .collect()
    }

    /// Returns the distinct predecessor task ids of a task.
    pub fn predecessors(&self, id: &TaskId) -> Vec<TaskId> {
        let mut seen = Vec::new();
        for dataflow in self.in_dataflows(id) {
            let source = dataflow.source_task_id();
            if !seen.contains(source) {
                seen.push(source.clone());
            }
        }
        seen
    }

    /// Returns the tasks with no inbound dataflows, in insertion order.
    pub fn source_tasks(&self) -> Vec<Arc<Task>> {
        self.boundary_tasks(Direction::Incoming)
    }

    /// Returns the tasks with no outbound dataflows, in insertion order.
    ///
    /// Leaf outputs make up the merged run result.
    pub fn leaf_tasks(&self) -> Vec<Arc<Task>> {
        self.boundary_tasks(Direction::Outgoing)
    }

    fn boundary_tasks(&self, direction: Direction) -> Vec<Arc<Task>> {
        self.task_order
            .iter()
            .filter_map(|id| {
                let index = *self.task_indices.get(id)?;
                if self.graph.edges_directed(index, direction).next().is_none() {
                    self.graph.node_weight(index).map(Arc::clone)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Returns task ids in a total order consistent with the dataflows.
    ///
    /// Kahn's algorithm with ties broken by insertion order, so
    /// independent tasks keep the order they were added in (index
    /// magnitude cannot serve as the tie-breaker: freed slots get
    /// reused). The graph is acyclic by construction, so the order
    /// always covers every task.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let positions: HashMap<NodeIndex, usize> = self
            .task_order
            .iter()
            .enumerate()
            .filter_map(|(position, id)| {
                self.task_indices.get(id).map(|index| (*index, position))
            })
            .collect();

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                (
                    index,
                    self.graph
                        .edges_directed(index, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .filter_map(|(index, _)| {
                positions
                    .get(index)
                    .map(|position| Reverse((*position, *index)))
            })
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, index))) = ready.pop() {
            if let Some(id) = self.index_to_id.get(&index) {
                order.push(id.clone());
            }
            for edge in self.graph.edges_directed(index, Direction::Outgoing) {
                let target = edge.target();
                if let Some(degree) = in_degree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0
                        && let Some(position) = positions.get(&target)
                    {
                        ready.push(Reverse((*position, target)));
                    }
                }
            }
        }
        order
    }
}
