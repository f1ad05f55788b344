//! Compound task kinds: sub-graph delegation and replicate fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use weft_graph::{
    ExecutionContext, GraphResult, Task, TaskError, TaskGraph, TaskId, TaskKind, TaskKindRef,
    TaskPayload, TaskSchema,
};

use crate::config::{CacheSelection, RunConfig};
use crate::error::EngineError;
use crate::merge::MergeStrategy;
use crate::runner::GraphRunner;

/// Tracing target for compound execution.
const TRACING_TARGET: &str = "weft_engine::compound";

/// Runs a compound task's sub-graph under the parent's signal,
/// provenance and cache, mapping the merged result back to a payload.
async fn run_subgraph(
    graph: TaskGraph,
    input: Option<TaskPayload>,
    ctx: &ExecutionContext,
    merge: MergeStrategy,
) -> Result<TaskPayload, TaskError> {
    let mut cfg = RunConfig::new()
        .with_merge(merge)
        .with_parent_signal(ctx.signal().clone())
        .with_parent_provenance(ctx.provenance().clone());
    if let Some(cache) = ctx.cache() {
        cfg = cfg.with_cache(CacheSelection::Shared(Arc::clone(cache)));
    }

    let runner = GraphRunner::new(graph);
    match runner.run(input, cfg).await {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            let mut payload = TaskPayload::new();
            payload.insert("output".into(), other);
            Ok(payload)
        }
        Err(EngineError::Group(group)) if group.has_abort_error() => Err(TaskError::Aborted),
        Err(error) => Err(TaskError::failed(error.to_string())),
    }
}

/// A static compound kind: owns a fixed sub-graph and expresses its
/// behaviour by delegating to a nested run.
///
/// The parent task's input is forwarded to the sub-graph's source tasks;
/// the sub-graph's leaf outputs merge per the kind's strategy (default
/// `last-or-property-array`) to form the compound output.
pub struct SubgraphKind {
    type_name: String,
    schema: TaskSchema,
    template: TaskGraph,
    merge: MergeStrategy,
}

impl SubgraphKind {
    /// Creates a compound kind over a fixed sub-graph.
    pub fn new(type_name: impl Into<String>, schema: TaskSchema, template: TaskGraph) -> Self {
        Self {
            type_name: type_name.into(),
            schema,
            template,
            merge: MergeStrategy::LastOrPropertyArray,
        }
    }

    /// Sets the strategy merging sub-graph leaves into the output.
    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }
}

#[async_trait]
impl TaskKind for SubgraphKind {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn schema(&self) -> &TaskSchema {
        &self.schema
    }

    fn is_compound(&self) -> bool {
        true
    }

    fn build_subgraph(
        &self,
        _task_id: &TaskId,
        _input: &TaskPayload,
    ) -> GraphResult<Option<TaskGraph>> {
        Ok(Some(self.template.clone()))
    }

    async fn execute(
        &self,
        input: &TaskPayload,
        ctx: &ExecutionContext,
    ) -> Result<TaskPayload, TaskError> {
        let graph = ctx
            .subgraph()
            .cloned()
            .ok_or_else(|| TaskError::failed("compound task has no sub-graph installed"))?;

        let forwarded = Some(input.clone()).filter(|input| !input.is_empty());
        run_subgraph(graph, forwarded, ctx, self.merge).await
    }
}

impl std::fmt::Debug for SubgraphKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubgraphKind")
            .field("type", &self.type_name)
            .field("template_tasks", &self.template.task_count())
            .finish_non_exhaustive()
    }
}

/// A regenerative compound kind that fans out over array inputs.
///
/// For every inner input port declared `replicate: true` whose run-input
/// holds a non-empty array, the Cartesian product of those arrays is
/// taken and one child task of the inner kind is instantiated per tuple
/// (child ids derive from the parent id plus a fresh UUID). Without any
/// replicated arrays the inner kind executes directly, with no
/// sub-graph.
pub struct ReplicateKind {
    inner: TaskKindRef,
    merge: MergeStrategy,
}

impl ReplicateKind {
    /// Wraps an inner kind for replication.
    pub fn new(inner: TaskKindRef) -> Self {
        Self {
            inner,
            merge: MergeStrategy::LastOrPropertyArray,
        }
    }

    /// Sets the strategy merging child outputs into the compound output.
    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }

    /// Collects the replicated ports holding non-empty arrays.
    fn replicated_arrays(&self, input: &TaskPayload) -> Vec<(String, Vec<Value>)> {
        self.inner
            .schema()
            .replicate_inputs()
            .filter_map(|port| {
                input
                    .get(&port.id)
                    .and_then(Value::as_array)
                    .filter(|values| !values.is_empty())
                    .map(|values| (port.id.clone(), values.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl TaskKind for ReplicateKind {
    fn type_name(&self) -> &str {
        self.inner.type_name()
    }

    fn schema(&self) -> &TaskSchema {
        self.inner.schema()
    }

    fn is_compound(&self) -> bool {
        true
    }

    fn build_subgraph(
        &self,
        task_id: &TaskId,
        input: &TaskPayload,
    ) -> GraphResult<Option<TaskGraph>> {
        let arrays = self.replicated_arrays(input);
        if arrays.is_empty() {
            return Ok(None);
        }

        let mut graph = TaskGraph::new();
        for tuple in cartesian_product(&arrays) {
            let mut defaults = input.clone();
            for ((port, _), value) in arrays.iter().zip(tuple) {
                defaults.insert(port.clone(), value);
            }
            let child_id = TaskId::new(format!("{}_{}", task_id, Uuid::now_v7()));
            graph.add_task(Task::new(child_id, Arc::clone(&self.inner)).with_defaults(defaults))?;
        }

        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %task_id,
            children = graph.task_count(),
            "Replicated sub-graph built"
        );
        Ok(Some(graph))
    }

    async fn execute(
        &self,
        input: &TaskPayload,
        ctx: &ExecutionContext,
    ) -> Result<TaskPayload, TaskError> {
        if self.replicated_arrays(input).is_empty() {
            return self.inner.execute(input, ctx).await;
        }

        match ctx.subgraph() {
            Some(graph) => run_subgraph(graph.clone(), None, ctx, self.merge).await,
            None => self.inner.execute(input, ctx).await,
        }
    }
}

impl std::fmt::Debug for ReplicateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicateKind")
            .field("type", &self.inner.type_name())
            .finish_non_exhaustive()
    }
}

/// Cartesian product of the replicated arrays; the first port varies
/// slowest.
fn cartesian_product(arrays: &[(String, Vec<Value>)]) -> Vec<Vec<Value>> {
    let mut tuples: Vec<Vec<Value>> = vec![Vec::new()];
    for (_, values) in arrays {
        let mut next = Vec::with_capacity(tuples.len() * values.len());
        for tuple in &tuples {
            for value in values {
                let mut extended = tuple.clone();
                extended.push(value.clone());
                next.push(extended);
            }
        }
        tuples = next;
    }
    tuples
}
