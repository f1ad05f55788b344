//! Graph runner: drives the scheduler and executes tasks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use weft_graph::payload::merge_shallow;
use weft_graph::{
    ExecutionContext, GraphEvent, GraphResult, OutputCache, Provenance, RunId, StreamingEvent,
    StreamingSignals, Task, TaskError, TaskGraph, TaskId, TaskPayload, TaskStatus,
};

use crate::config::RunConfig;
use crate::error::{EngineError, EngineResult, ErrorEntry, ErrorGroup};
use crate::merge::{LeafResult, merge_leaves};
use crate::scheduler::{DependencyScheduler, TaskScheduler, TopologicalScheduler};

/// Tracing target for runner operations.
const TRACING_TARGET: &str = "weft_engine::runner";

/// Report sent from a worker task back to the run coordinator.
enum WorkerMessage {
    Finished {
        task_id: TaskId,
        provenance: Provenance,
        result: Result<TaskPayload, TaskError>,
    },
    StreamingStarted {
        task_id: TaskId,
    },
    StreamingChunk {
        task_id: TaskId,
    },
}

/// Orchestrates runs over one task graph.
///
/// The runner drives a scheduler from a single coordinator loop, spawns
/// one worker per ready task, propagates values, provenance, status and
/// errors along dataflows, consults the selected output cache, and
/// merges leaf outputs into the configured result shape. At most one run
/// (full or reactive) may be in progress per runner.
pub struct GraphRunner {
    graph: TaskGraph,
    default_cache: Option<Arc<dyn OutputCache>>,
    running: AtomicBool,
    abort_token: Mutex<Option<CancellationToken>>,
}

impl GraphRunner {
    /// Creates a runner over a graph.
    pub fn new(graph: TaskGraph) -> Self {
        Self {
            graph,
            default_cache: None,
            running: AtomicBool::new(false),
            abort_token: Mutex::new(None),
        }
    }

    /// Injects the cache used when a run selects the default cache.
    pub fn with_default_cache(mut self, cache: Arc<dyn OutputCache>) -> Self {
        self.default_cache = Some(cache);
        self
    }

    /// Returns the graph this runner drives.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Requests cancellation of the run in progress, if any.
    pub fn abort(&self) {
        let token = self
            .abort_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(token) = token {
            tracing::debug!(target: TRACING_TARGET, "Abort requested");
            token.cancel();
        }
    }

    /// Executes the graph to completion.
    ///
    /// `input` overrides are merged into the source tasks (tasks without
    /// inbound dataflows) before scheduling. Tasks are released the
    /// moment their predecessors are satisfied and execute concurrently;
    /// leaf outputs merge per the configured strategy. A failed or
    /// aborted run surfaces exactly one [`ErrorGroup`].
    pub async fn run(&self, input: Option<TaskPayload>, cfg: RunConfig) -> EngineResult<Value> {
        let _guard = RunGuard::acquire(&self.running).ok_or(EngineError::AlreadyRunning)?;

        let cache = cfg.cache.resolve(self.default_cache.as_ref());
        let token = match &cfg.parent_signal {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        {
            let mut slot = self
                .abort_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = Some(token.clone());
        }

        let run_id = cfg.run_id.unwrap_or_default();
        let result = self.run_inner(input, &cfg, cache, token, run_id).await;

        let mut slot = self
            .abort_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = None;
        drop(slot);

        result
    }

    async fn run_inner(
        &self,
        input: Option<TaskPayload>,
        cfg: &RunConfig,
        cache: Option<Arc<dyn OutputCache>>,
        token: CancellationToken,
        run_id: RunId,
    ) -> EngineResult<Value> {
        reset_graph(&self.graph, run_id)?;

        if let Some(input) = &input {
            for task in self.graph.source_tasks() {
                task.set_input(input)?;
            }
        }

        self.graph.events().emit(GraphEvent::RunStarted { run_id });
        tracing::debug!(
            target: TRACING_TARGET,
            run_id = %run_id,
            task_count = self.graph.task_count(),
            "Starting graph run"
        );

        let mut scheduler = DependencyScheduler::new(&self.graph);
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let mut in_flight: HashMap<TaskId, JoinHandle<()>> = HashMap::new();
        let mut failed: Vec<ErrorEntry> = Vec::new();
        let mut leaves: HashMap<TaskId, TaskPayload> = HashMap::new();
        let mut completed = 0usize;
        let total = self.graph.task_count();
        let mut aborted = token.is_cancelled();

        loop {
            if aborted || !failed.is_empty() {
                break;
            }
            let has_pending = scheduler.has_pending();
            if in_flight.is_empty() && !has_pending {
                break;
            }

            tokio::select! {
                biased;

                () = token.cancelled() => {
                    aborted = true;
                }

                Some(message) = worker_rx.recv() => {
                    self.handle_worker_message(
                        message,
                        &token,
                        &mut scheduler,
                        &mut in_flight,
                        &mut failed,
                        &mut leaves,
                        &mut completed,
                        total,
                        run_id,
                    );
                }

                Some(task_id) = scheduler.next_ready(), if has_pending => {
                    self.dispatch(
                        task_id,
                        run_id,
                        &token,
                        cache.as_ref(),
                        cfg,
                        &worker_tx,
                        &mut in_flight,
                        &mut failed,
                    );
                }
            }
        }

        if aborted {
            tracing::debug!(
                target: TRACING_TARGET,
                run_id = %run_id,
                in_flight = in_flight.len(),
                "Run aborted; settling in-flight tasks"
            );
            self.abort_processing_tasks();
        }

        // Settled-semantics wait: every in-flight worker is awaited and
        // join failures are observed rather than thrown.
        let settled = futures::future::join_all(
            in_flight
                .drain()
                .map(|(task_id, handle)| async move { (task_id, handle.await) }),
        )
        .await;
        for (task_id, join_result) in settled {
            if let Err(join_error) = join_result {
                failed.push(ErrorEntry::new(
                    task_id.to_string(),
                    TaskError::failed(format!("worker panicked: {join_error}")),
                ));
            }
        }

        // Bookkeeping for tasks that finished while the drain loop was
        // already stopping: mirror their edges and record late results.
        while let Ok(message) = worker_rx.try_recv() {
            if let WorkerMessage::Finished {
                task_id,
                provenance,
                result,
            } = message
            {
                match result {
                    Ok(output) => self.finish_task(&task_id, &output, &provenance, &mut leaves),
                    Err(error) => {
                        self.mirror_failure(&task_id, &error);
                        if !error.is_abort() {
                            failed.push(ErrorEntry::new(task_id.to_string(), error));
                        }
                    }
                }
            }
        }

        if aborted || !failed.is_empty() {
            self.skip_unreached_tasks();

            let mut entries = std::mem::take(&mut failed);
            if aborted {
                entries.push(ErrorEntry::aborted());
            }
            let group = ErrorGroup::new(entries);

            self.graph.events().emit(GraphEvent::RunFailed {
                run_id,
                errors: group
                    .errors()
                    .iter()
                    .map(|entry| (entry.key.clone(), entry.error.to_string()))
                    .collect(),
            });
            if aborted {
                self.graph.events().emit(GraphEvent::RunAborted { run_id });
            }

            tracing::debug!(
                target: TRACING_TARGET,
                run_id = %run_id,
                errors = group.len(),
                aborted,
                "Graph run failed"
            );
            return Err(EngineError::Group(group));
        }

        let ordered = self.ordered_leaves(&leaves);
        let merged = merge_leaves(cfg.merge, &ordered);
        self.graph.events().emit(GraphEvent::RunCompleted { run_id });
        tracing::debug!(
            target: TRACING_TARGET,
            run_id = %run_id,
            leaf_count = ordered.len(),
            "Graph run completed"
        );
        Ok(merged)
    }

    /// Executes a reactive pass over the graph in topological order.
    ///
    /// Each still-pending task receives its inbound values and runs its
    /// reactive computation; outputs flow downstream and leaves merge as
    /// configured. The cache is never consulted, and errors never stop
    /// the iteration.
    pub async fn run_reactive(
        &self,
        input: Option<TaskPayload>,
        cfg: RunConfig,
    ) -> EngineResult<Value> {
        let _guard = RunGuard::acquire(&self.running).ok_or(EngineError::AlreadyRunning)?;
        let run_id = cfg.run_id.unwrap_or_default();

        if let Some(input) = &input {
            for task in self.graph.source_tasks() {
                task.set_input(input)?;
            }
        }

        let mut scheduler = TopologicalScheduler::new(&self.graph);
        let mut leaves: HashMap<TaskId, TaskPayload> = HashMap::new();

        while let Some(task_id) = scheduler.next_ready().await {
            let Some(task) = self.graph.task(&task_id) else {
                continue;
            };
            if task.status() != TaskStatus::Pending {
                scheduler.on_task_completed(&task_id);
                continue;
            }

            if let Err(error) = self.copy_inbound_inputs(&task) {
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_id = %task_id,
                    error = %error,
                    "Reactive input copy failed; continuing"
                );
                scheduler.on_task_completed(&task_id);
                continue;
            }

            let provenance = self.compose_provenance(&task, &cfg.parent_provenance);
            let ctx = ExecutionContext::new(run_id, CancellationToken::new(), provenance.clone());

            match task.run_reactive(None, &ctx).await {
                Ok(output) => {
                    let out_edges = self.graph.out_dataflows(&task_id);
                    for edge in &out_edges {
                        edge.set_port_data(&output, &provenance);
                    }
                    if out_edges.is_empty() {
                        leaves.insert(task_id.clone(), output);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        task_id = %task_id,
                        error = %error,
                        "Reactive pass failed; continuing"
                    );
                }
            }
            scheduler.on_task_completed(&task_id);
        }

        let ordered = self.ordered_leaves(&leaves);
        Ok(merge_leaves(cfg.merge, &ordered))
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        task_id: TaskId,
        run_id: RunId,
        token: &CancellationToken,
        cache: Option<&Arc<dyn OutputCache>>,
        cfg: &RunConfig,
        worker_tx: &mpsc::UnboundedSender<WorkerMessage>,
        in_flight: &mut HashMap<TaskId, JoinHandle<()>>,
        failed: &mut Vec<ErrorEntry>,
    ) {
        let Some(task) = self.graph.task(&task_id) else {
            return;
        };

        let provenance = self.compose_provenance(&task, &cfg.parent_provenance);

        if let Err(error) = self.copy_inbound_inputs(&task) {
            let error = TaskError::failed(error.to_string());
            self.mirror_failure(&task_id, &error);
            failed.push(ErrorEntry::new(task_id.to_string(), error));
            return;
        }

        let mut ctx = ExecutionContext::new(run_id, token.clone(), provenance.clone());
        if let Some(cache) = cache {
            ctx = ctx.with_cache(Arc::clone(cache));
        }
        let streaming_tx = worker_tx.clone();
        let streaming_id = task_id.clone();
        ctx = ctx.with_streaming(StreamingSignals::new(move |event| {
            let message = match event {
                StreamingEvent::Started => WorkerMessage::StreamingStarted {
                    task_id: streaming_id.clone(),
                },
                StreamingEvent::Chunk => WorkerMessage::StreamingChunk {
                    task_id: streaming_id.clone(),
                },
            };
            let _ = streaming_tx.send(message);
        }));

        tracing::debug!(target: TRACING_TARGET, task_id = %task_id, "Dispatching task");

        let worker_tx = worker_tx.clone();
        let worker_id = task_id.clone();
        let handle = tokio::spawn(async move {
            let result = task.run_full(None, &ctx).await;
            let _ = worker_tx.send(WorkerMessage::Finished {
                task_id: worker_id,
                provenance,
                result,
            });
        });
        in_flight.insert(task_id, handle);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_worker_message(
        &self,
        message: WorkerMessage,
        token: &CancellationToken,
        scheduler: &mut DependencyScheduler,
        in_flight: &mut HashMap<TaskId, JoinHandle<()>>,
        failed: &mut Vec<ErrorEntry>,
        leaves: &mut HashMap<TaskId, TaskPayload>,
        completed: &mut usize,
        total: usize,
        run_id: RunId,
    ) {
        match message {
            WorkerMessage::StreamingStarted { task_id } => {
                scheduler.on_streaming_start(&task_id);
            }
            WorkerMessage::StreamingChunk { task_id } => {
                scheduler.on_streaming_chunk(&task_id);
            }
            WorkerMessage::Finished {
                task_id,
                provenance,
                result,
            } => {
                in_flight.remove(&task_id);
                match result {
                    Ok(output) => {
                        self.finish_task(&task_id, &output, &provenance, leaves);
                        scheduler.on_task_completed(&task_id);
                        *completed += 1;
                        let progress = if total == 0 {
                            100.0
                        } else {
                            (*completed as f32 / total as f32) * 100.0
                        };
                        self.graph.events().emit(GraphEvent::Progress {
                            run_id,
                            progress,
                            message: format!("{completed} of {total} tasks completed"),
                        });
                    }
                    Err(error) => {
                        self.mirror_failure(&task_id, &error);
                        // An abort error outside a cancelled run means the
                        // task raised the sentinel spuriously; treat it as
                        // a failure so the drain cannot stall.
                        if !error.is_abort() || !token.is_cancelled() {
                            tracing::warn!(
                                target: TRACING_TARGET,
                                task_id = %task_id,
                                error = %error,
                                "Task failed"
                            );
                            failed.push(ErrorEntry::new(task_id.to_string(), error));
                        }
                    }
                }
            }
        }
    }

    /// Pushes a finished task's output and status downstream.
    ///
    /// Output values become visible on outbound dataflows before the
    /// scheduler is notified of the completion; status propagation
    /// happens in the same coordinator step.
    fn finish_task(
        &self,
        task_id: &TaskId,
        output: &TaskPayload,
        provenance: &Provenance,
        leaves: &mut HashMap<TaskId, TaskPayload>,
    ) {
        let out_edges = self.graph.out_dataflows(task_id);
        for edge in &out_edges {
            edge.set_port_data(output, provenance);
        }
        if out_edges.is_empty() {
            leaves.insert(task_id.clone(), output.clone());
        }

        let (status, error) = self
            .graph
            .task(task_id)
            .map(|task| (task.status(), task.error()))
            .unwrap_or((TaskStatus::Completed, None));
        for edge in &out_edges {
            edge.set_status(status, error.clone());
        }
    }

    fn mirror_failure(&self, task_id: &TaskId, error: &TaskError) {
        let status = self
            .graph
            .task(task_id)
            .map(|task| task.status())
            .unwrap_or(TaskStatus::Failed);
        for edge in self.graph.out_dataflows(task_id) {
            edge.set_status(status, Some(error.clone()));
        }
    }

    fn compose_provenance(&self, task: &Task, parent: &Provenance) -> Provenance {
        let mut provenance = parent.clone();
        for edge in self.graph.in_dataflows(task.id()) {
            merge_shallow(&mut provenance, &edge.provenance());
        }
        merge_shallow(&mut provenance, task.provenance());
        provenance
    }

    /// Copies inbound dataflow values into a task's input.
    ///
    /// Each delivered port is cleared once before the first edge writes
    /// it, so repeated runs stay idempotent while fan-in from several
    /// edges still appends within one run.
    fn copy_inbound_inputs(&self, task: &Task) -> GraphResult<()> {
        let mut delivered: HashSet<String> = HashSet::new();
        for edge in self.graph.in_dataflows(task.id()) {
            let data = edge.port_data();
            for key in data.keys() {
                if delivered.insert(key.clone()) {
                    task.remove_input(key);
                }
            }
            task.set_input(&data)?;
        }
        Ok(())
    }

    fn abort_processing_tasks(&self) {
        for task in self.graph.tasks() {
            if task.status() == TaskStatus::Processing {
                task.abort();
                for edge in self.graph.out_dataflows(task.id()) {
                    edge.set_status(TaskStatus::Aborting, Some(TaskError::Aborted));
                }
            }
        }
    }

    fn skip_unreached_tasks(&self) {
        for task in self.graph.tasks() {
            if task.status() == TaskStatus::Pending {
                task.skip();
                for edge in self.graph.out_dataflows(task.id()) {
                    edge.set_status(TaskStatus::Skipped, None);
                }
            }
        }
    }

    fn ordered_leaves(&self, leaves: &HashMap<TaskId, TaskPayload>) -> Vec<LeafResult> {
        self.graph
            .tasks()
            .filter_map(|task| {
                leaves.get(task.id()).map(|data| LeafResult {
                    id: task.id().clone(),
                    type_name: task.type_name().to_owned(),
                    data: data.clone(),
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for GraphRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRunner")
            .field("tasks", &self.graph.task_count())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

/// Resets every task and outbound dataflow for a new run, recursing into
/// compound sub-graphs with the same run id.
///
/// Compound tasks whose run-input deep-differs from their defaults (or
/// that have no sub-graph installed yet) are regenerated first.
fn reset_graph(graph: &TaskGraph, run_id: RunId) -> EngineResult<()> {
    for task in graph.tasks() {
        task.reset(run_id);
        for edge in graph.out_dataflows(task.id()) {
            edge.clear();
        }

        if task.is_compound() {
            let needs_regenerate =
                task.subgraph().is_none() || task.run_input() != *task.defaults();
            if needs_regenerate && task.regenerate_subgraph()? {
                graph.events().emit(GraphEvent::Regenerated {
                    task_id: task.id().clone(),
                });
            }
            if let Some(subgraph) = task.subgraph() {
                reset_graph(&subgraph, run_id)?;
            }
        }
    }
    Ok(())
}

/// Releases the runner's re-entrancy flag on drop.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use weft_graph::payload::payload_from;
    use weft_graph::{PortSchema, PortType, TaskEvent, TaskSchema};

    use super::*;
    use crate::cache::InMemoryOutputCache;
    use crate::config::CacheSelection;
    use crate::merge::MergeStrategy;

    fn number(input: &TaskPayload, key: &str) -> i64 {
        input.get(key).and_then(Value::as_i64).unwrap_or(0)
    }

    struct SquareKind {
        schema: TaskSchema,
    }

    impl SquareKind {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                schema: TaskSchema::new(
                    vec![PortSchema::new("input", PortType::Number)],
                    vec![PortSchema::new("output", PortType::Number)],
                ),
            })
        }
    }

    #[async_trait]
    impl weft_graph::TaskKind for SquareKind {
        fn type_name(&self) -> &str {
            "Square"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            input: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            let n = number(input, "input");
            Ok(payload_from([("output", json!(n * n))]))
        }

        async fn execute_reactive(
            &self,
            input: &TaskPayload,
            _output: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            let n = number(input, "input");
            Ok(payload_from([("output", json!(n * n))]))
        }
    }

    struct DoubleKind {
        schema: TaskSchema,
    }

    impl DoubleKind {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                schema: TaskSchema::new(
                    vec![PortSchema::new("input", PortType::Number)],
                    vec![PortSchema::new("output", PortType::Number)],
                ),
            })
        }
    }

    #[async_trait]
    impl weft_graph::TaskKind for DoubleKind {
        fn type_name(&self) -> &str {
            "Double"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            input: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            let n = number(input, "input");
            Ok(payload_from([("output", json!(n * 2))]))
        }
    }

    struct AddKind {
        schema: TaskSchema,
    }

    impl AddKind {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                schema: TaskSchema::new(
                    vec![
                        PortSchema::new("a", PortType::Number),
                        PortSchema::new("b", PortType::Number),
                    ],
                    vec![PortSchema::new("output", PortType::Number)],
                ),
            })
        }
    }

    #[async_trait]
    impl weft_graph::TaskKind for AddKind {
        fn type_name(&self) -> &str {
            "Add"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            input: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            Ok(payload_from([(
                "output",
                json!(number(input, "a") + number(input, "b")),
            )]))
        }
    }

    struct FailingKind {
        schema: TaskSchema,
    }

    impl FailingKind {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                schema: TaskSchema::new(
                    vec![PortSchema::new("in", PortType::Any).with_default(json!(null))],
                    vec![],
                ),
            })
        }
    }

    #[async_trait]
    impl weft_graph::TaskKind for FailingKind {
        fn type_name(&self) -> &str {
            "Failing"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            _input: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            Err(TaskError::failed("boom"))
        }
    }

    struct SleepKind {
        schema: TaskSchema,
        duration: Duration,
    }

    impl SleepKind {
        fn shared(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                schema: TaskSchema::new(
                    vec![PortSchema::new("input", PortType::Any).with_default(json!(null))],
                    vec![PortSchema::new("output", PortType::Any)],
                ),
                duration,
            })
        }
    }

    #[async_trait]
    impl weft_graph::TaskKind for SleepKind {
        fn type_name(&self) -> &str {
            "Sleep"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            _input: &TaskPayload,
            ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            tokio::select! {
                () = tokio::time::sleep(self.duration) => {
                    Ok(payload_from([("output", json!("done"))]))
                }
                () = ctx.signal().cancelled() => Err(TaskError::Aborted),
            }
        }
    }

    struct GenKind {
        schema: TaskSchema,
        calls: AtomicUsize,
    }

    impl GenKind {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                schema: TaskSchema::new(
                    vec![PortSchema::new("prompt", PortType::String)],
                    vec![PortSchema::new("image", PortType::String)],
                ),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl weft_graph::TaskKind for GenKind {
        fn type_name(&self) -> &str {
            "Gen"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        fn cacheable(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            input: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = input.get("prompt").and_then(Value::as_str).unwrap_or("");
            Ok(payload_from([("image", json!(format!("image::{prompt}")))]))
        }
    }

    struct StreamingKind {
        schema: TaskSchema,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl weft_graph::TaskKind for StreamingKind {
        fn type_name(&self) -> &str {
            "Streaming"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            _input: &TaskPayload,
            ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            ctx.report_stream_start();
            ctx.report_stream_chunk();
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push("source:done".into());
            Ok(payload_from([("output", json!(1))]))
        }
    }

    struct RecorderKind {
        schema: TaskSchema,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl weft_graph::TaskKind for RecorderKind {
        fn type_name(&self) -> &str {
            "Recorder"
        }

        fn schema(&self) -> &TaskSchema {
            &self.schema
        }

        async fn execute(
            &self,
            _input: &TaskPayload,
            _ctx: &ExecutionContext,
        ) -> Result<TaskPayload, TaskError> {
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push("sink:start".into());
            Ok(payload_from([("output", json!(2))]))
        }
    }

    fn square_task(id: &str, input: i64) -> Task {
        Task::new(id, SquareKind::shared()).with_defaults(payload_from([("input", json!(input))]))
    }

    #[tokio::test]
    async fn test_s1_independent_leaves_named() {
        let mut graph = TaskGraph::new();
        graph.add_task(square_task("task1", 5)).expect("task1");
        graph
            .add_task(
                Task::new("task2", DoubleKind::shared())
                    .with_defaults(payload_from([("input", json!(5))])),
            )
            .expect("task2");

        let runner = GraphRunner::new(graph);
        let result = runner
            .run(None, RunConfig::new().with_merge(MergeStrategy::Named))
            .await
            .expect("run");

        assert_eq!(
            result,
            json!([
                {"id": "task1", "type": "Square", "data": {"output": 25}},
                {"id": "task2", "type": "Double", "data": {"output": 10}},
            ])
        );
    }

    #[tokio::test]
    async fn test_s2_chain_with_add_last() {
        let mut graph = TaskGraph::new();
        graph.add_task(square_task("task1", 5)).expect("task1");
        graph
            .add_task(
                Task::new("task2", DoubleKind::shared())
                    .with_defaults(payload_from([("input", json!(5))])),
            )
            .expect("task2");
        graph
            .add_task(Task::new("task3", AddKind::shared()))
            .expect("task3");
        graph.connect("task1", "output", "task3", "a").expect("edge");
        graph.connect("task2", "output", "task3", "b").expect("edge");

        let runner = GraphRunner::new(graph);
        let result = runner
            .run(None, RunConfig::new().with_merge(MergeStrategy::Last))
            .await
            .expect("run");

        assert_eq!(result, json!({"output": 35}));
    }

    #[tokio::test]
    async fn test_s4_failure_mid_graph() {
        let mut graph = TaskGraph::new();
        graph.add_task(square_task("square", 5)).expect("square");
        graph
            .add_task(Task::new("failing", FailingKind::shared()))
            .expect("failing");
        graph
            .connect("square", "output", "failing", "in")
            .expect("edge");

        let runner = GraphRunner::new(graph);
        let err = runner
            .run(None, RunConfig::new())
            .await
            .expect_err("must fail");

        let EngineError::Group(group) = err else {
            panic!("expected error group, got {err:?}");
        };
        assert_eq!(group.len(), 1);
        assert!(!group.has_abort_error());
        let entry = group.error_by_key("failing").expect("failing entry");
        assert_eq!(entry.kind(), "TaskFailed");

        let square = runner.graph().task(&TaskId::from("square")).expect("square");
        let failing = runner.graph().task(&TaskId::from("failing")).expect("failing");
        assert_eq!(square.status(), TaskStatus::Completed);
        assert_eq!(failing.status(), TaskStatus::Failed);

        // The completed source's outbound edge mirrors its status.
        let edge = runner
            .graph()
            .out_dataflows(&TaskId::from("square"))
            .remove(0);
        assert_eq!(edge.status(), TaskStatus::Completed);
        assert_eq!(edge.error(), None);
        assert_eq!(edge.value(), Some(json!(25)));
    }

    #[tokio::test]
    async fn test_s5_abort_shortly_after_start() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new("long-running", SleepKind::shared(Duration::from_secs(10))))
            .expect("long");
        graph
            .add_task(
                Task::new("target", DoubleKind::shared())
                    .with_defaults(payload_from([("input", json!(0))])),
            )
            .expect("target");
        graph
            .connect("long-running", "output", "target", "input")
            .expect("edge");

        let runner = Arc::new(GraphRunner::new(graph));
        let handle = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(None, RunConfig::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.abort();

        let err = handle.await.expect("join").expect_err("aborted run fails");
        let EngineError::Group(group) = err else {
            panic!("expected error group, got {err:?}");
        };
        assert!(group.has_abort_error());
        assert!(group.error_by_key("*").is_some());

        let long = runner
            .graph()
            .task(&TaskId::from("long-running"))
            .expect("long");
        assert_eq!(long.status(), TaskStatus::Aborting);

        let edge = runner
            .graph()
            .out_dataflows(&TaskId::from("long-running"))
            .remove(0);
        assert_eq!(edge.status(), TaskStatus::Aborting);
        assert_eq!(edge.error(), Some(TaskError::Aborted));

        // The unreached successor never completed.
        let target = runner.graph().task(&TaskId::from("target")).expect("target");
        assert_eq!(target.status(), TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_s6_cache_hit_second_run() {
        let kind = GenKind::shared();
        let cache = Arc::new(InMemoryOutputCache::new());

        let mut graph = TaskGraph::new();
        graph
            .add_task(
                Task::new("gen", kind.clone())
                    .with_defaults(payload_from([("prompt", json!("x"))])),
            )
            .expect("gen");

        let runner = GraphRunner::new(graph);
        let cfg = || {
            RunConfig::new()
                .with_merge(MergeStrategy::Last)
                .with_cache(CacheSelection::Shared(cache.clone()))
        };

        let first = runner.run(None, cfg()).await.expect("first run");
        assert_eq!(first, json!({"image": "image::x"}));
        assert_eq!(kind.calls.load(Ordering::SeqCst), 1);

        // The cache now holds the output under (type, input).
        let cached = cache
            .get_output("Gen", &payload_from([("prompt", json!("x"))]))
            .await;
        assert_eq!(cached, Some(payload_from([("image", json!("image::x"))])));

        let task = runner.graph().task(&TaskId::from("gen")).expect("gen");
        let mut events = task.events().subscribe();

        let second = runner.run(None, cfg()).await.expect("second run");
        assert_eq!(second, first);
        // No second execution; events still emitted.
        assert_eq!(kind.calls.load(Ordering::SeqCst), 1);

        let mut saw_start = false;
        let mut saw_complete = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TaskEvent::Start { .. } => saw_start = true,
                TaskEvent::Complete { .. } => saw_complete = true,
                _ => {}
            }
        }
        assert!(saw_start && saw_complete);
    }

    #[tokio::test]
    async fn test_reentrant_run_rejected() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new("long", SleepKind::shared(Duration::from_secs(5))))
            .expect("long");

        let runner = Arc::new(GraphRunner::new(graph));
        let handle = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(None, RunConfig::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = runner.run(None, RunConfig::new()).await;
        assert!(matches!(err, Err(EngineError::AlreadyRunning)));

        runner.abort();
        let _ = handle.await.expect("join");
    }

    #[tokio::test]
    async fn test_parent_signal_already_aborted() {
        let kind = GenKind::shared();
        let mut graph = TaskGraph::new();
        graph
            .add_task(
                Task::new("gen", kind.clone())
                    .with_defaults(payload_from([("prompt", json!("x"))])),
            )
            .expect("gen");

        let parent = CancellationToken::new();
        parent.cancel();

        let runner = GraphRunner::new(graph);
        let err = runner
            .run(None, RunConfig::new().with_parent_signal(parent))
            .await
            .expect_err("aborted");

        let EngineError::Group(group) = err else {
            panic!("expected error group, got {err:?}");
        };
        assert!(group.has_abort_error());
        // Nothing executed.
        assert_eq!(kind.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parent_signal_propagates() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new("long", SleepKind::shared(Duration::from_secs(10))))
            .expect("long");

        let parent = CancellationToken::new();
        let runner = Arc::new(GraphRunner::new(graph));
        let handle = {
            let runner = Arc::clone(&runner);
            let parent = parent.clone();
            tokio::spawn(async move {
                runner
                    .run(None, RunConfig::new().with_parent_signal(parent))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        parent.cancel();

        let err = handle.await.expect("join").expect_err("aborted");
        let EngineError::Group(group) = err else {
            panic!("expected error group, got {err:?}");
        };
        assert!(group.has_abort_error());
    }

    #[tokio::test]
    async fn test_streaming_predecessor_releases_successor_early() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let streaming = Arc::new(StreamingKind {
            schema: TaskSchema::new(
                vec![],
                vec![PortSchema::new("output", PortType::Number)],
            ),
            log: Arc::clone(&log),
        });
        let recorder = Arc::new(RecorderKind {
            schema: TaskSchema::new(
                vec![PortSchema::new("input", PortType::Any).with_default(json!(null))],
                vec![PortSchema::new("output", PortType::Number)],
            ),
            log: Arc::clone(&log),
        });

        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new("source", streaming))
            .expect("source");
        graph.add_task(Task::new("sink", recorder)).expect("sink");
        graph
            .connect("source", "output", "sink", "input")
            .expect("edge");

        let runner = GraphRunner::new(graph);
        runner.run(None, RunConfig::new()).await.expect("run");

        let entries = log.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let sink_pos = entries
            .iter()
            .position(|entry| entry == "sink:start")
            .expect("sink ran");
        let source_done = entries
            .iter()
            .position(|entry| entry == "source:done")
            .expect("source finished");
        assert!(
            sink_pos < source_done,
            "successor should start while the streaming source is still running: {entries:?}"
        );
    }

    #[tokio::test]
    async fn test_run_input_reaches_source_tasks() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new("task1", SquareKind::shared()))
            .expect("task1");

        let runner = GraphRunner::new(graph);
        let result = runner
            .run(
                Some(payload_from([("input", json!(7))])),
                RunConfig::new().with_merge(MergeStrategy::Last),
            )
            .await
            .expect("run");

        assert_eq!(result, json!({"output": 49}));
    }

    #[tokio::test]
    async fn test_repeated_runs_are_idempotent_for_array_fan_in() {
        struct SumKind {
            schema: TaskSchema,
        }

        #[async_trait]
        impl weft_graph::TaskKind for SumKind {
            fn type_name(&self) -> &str {
                "Sum"
            }

            fn schema(&self) -> &TaskSchema {
                &self.schema
            }

            async fn execute(
                &self,
                input: &TaskPayload,
                _ctx: &ExecutionContext,
            ) -> Result<TaskPayload, TaskError> {
                let sum: i64 = input
                    .get("values")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(payload_from([("output", json!(sum))]))
            }
        }

        let sum = Arc::new(SumKind {
            schema: TaskSchema::new(
                vec![PortSchema::new("values", PortType::Number).with_array()],
                vec![PortSchema::new("output", PortType::Number)],
            ),
        });

        let mut graph = TaskGraph::new();
        graph.add_task(square_task("task1", 5)).expect("task1");
        graph.add_task(square_task("task2", 6)).expect("task2");
        graph.add_task(Task::new("sum", sum)).expect("sum");
        // Two edges fan into the same array port.
        graph.connect("task1", "output", "sum", "values").expect("edge");
        graph.connect("task2", "output", "sum", "values").expect("edge2");

        let runner = GraphRunner::new(graph);
        let cfg = || RunConfig::new().with_merge(MergeStrategy::Last);

        let first = runner.run(None, cfg()).await.expect("first");
        // Edge-fed ports are cleared per run, so appends do not pile up.
        let second = runner.run(None, cfg()).await.expect("second");
        assert_eq!(first, json!({"output": 61}));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_failure_skips_unreached_tasks() {
        let mut graph = TaskGraph::new();
        graph
            .add_task(Task::new("failing", FailingKind::shared()))
            .expect("failing");
        graph
            .add_task(
                Task::new("after", DoubleKind::shared())
                    .with_defaults(payload_from([("input", json!(1))])),
            )
            .expect("after");
        graph
            .connect("failing", "out", "after", "input")
            .expect("edge");

        let runner = GraphRunner::new(graph);
        let _ = runner.run(None, RunConfig::new()).await.expect_err("fails");

        let after = runner.graph().task(&TaskId::from("after")).expect("after");
        assert_eq!(after.status(), TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_run_reactive_chain() {
        let mut graph = TaskGraph::new();
        graph.add_task(square_task("task1", 6)).expect("task1");

        let runner = GraphRunner::new(graph);
        let result = runner
            .run_reactive(None, RunConfig::new().with_merge(MergeStrategy::Last))
            .await
            .expect("reactive run");

        assert_eq!(result, json!({"output": 36}));

        // Reactive passes leave tasks pending.
        let task = runner.graph().task(&TaskId::from("task1")).expect("task1");
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_reactive_never_consults_cache() {
        let kind = GenKind::shared();
        let cache = Arc::new(InMemoryOutputCache::new());
        let mut graph = TaskGraph::new();
        graph
            .add_task(
                Task::new("gen", kind.clone())
                    .with_defaults(payload_from([("prompt", json!("x"))])),
            )
            .expect("gen");

        let runner =
            GraphRunner::new(graph).with_default_cache(cache.clone() as Arc<dyn OutputCache>);
        runner
            .run_reactive(None, RunConfig::new().with_cache(CacheSelection::Default))
            .await
            .expect("reactive");

        // No execution and no cache writes happened.
        assert_eq!(kind.calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_provenance_flows_downstream() {
        struct ProvenanceKind {
            schema: TaskSchema,
            seen: Arc<StdMutex<Option<Provenance>>>,
        }

        #[async_trait]
        impl weft_graph::TaskKind for ProvenanceKind {
            fn type_name(&self) -> &str {
                "Witness"
            }

            fn schema(&self) -> &TaskSchema {
                &self.schema
            }

            async fn execute(
                &self,
                _input: &TaskPayload,
                ctx: &ExecutionContext,
            ) -> Result<TaskPayload, TaskError> {
                *self.seen.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(ctx.provenance().clone());
                Ok(payload_from([("output", json!(1))]))
            }
        }

        let seen = Arc::new(StdMutex::new(None));
        let witness = Arc::new(ProvenanceKind {
            schema: TaskSchema::new(
                vec![PortSchema::new("input", PortType::Any).with_default(json!(null))],
                vec![PortSchema::new("output", PortType::Number)],
            ),
            seen: Arc::clone(&seen),
        });

        let mut graph = TaskGraph::new();
        graph
            .add_task(
                square_task("up", 2).with_provenance(payload_from([("model", json!("sq-1"))])),
            )
            .expect("up");
        graph.add_task(Task::new("down", witness)).expect("down");
        graph.connect("up", "output", "down", "input").expect("edge");

        let runner = GraphRunner::new(graph);
        runner
            .run(
                None,
                RunConfig::new()
                    .with_parent_provenance(payload_from([("tenant", json!("acme"))])),
            )
            .await
            .expect("run");

        let observed = seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .expect("witness executed");
        // Parent provenance plus the upstream task's own contribution.
        assert_eq!(observed.get("tenant"), Some(&json!("acme")));
        assert_eq!(observed.get("model"), Some(&json!("sq-1")));
    }
}
