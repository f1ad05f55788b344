//! The task-kind seam between the graph model and execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ProgressReporter, RunId, TaskId};
use crate::cache::OutputCache;
use crate::error::{GraphResult, TaskError};
use crate::graph::TaskGraph;
use crate::payload::{Provenance, TaskPayload};
use crate::task::TaskSchema;

/// Shared handle to a task kind.
pub type TaskKindRef = Arc<dyn TaskKind>;

/// The behaviour of a task type.
///
/// A kind is stateless and shared: one instance backs every task of its
/// type. Per-task state (inputs, outputs, status) lives on
/// [`Task`](crate::task::Task).
#[async_trait]
pub trait TaskKind: Send + Sync {
    /// Stable type name, used for cache keys and serialized definitions.
    fn type_name(&self) -> &str;

    /// Declared input and output ports.
    fn schema(&self) -> &TaskSchema;

    /// Whether outputs of this kind may be served from and written to the
    /// output cache.
    fn cacheable(&self) -> bool {
        false
    }

    /// Whether tasks of this kind own a sub-graph.
    fn is_compound(&self) -> bool {
        false
    }

    /// Builds (or rebuilds) the sub-graph for a compound task from its
    /// current run-input. Returning `None` keeps the installed sub-graph,
    /// or leaves the task without one.
    fn build_subgraph(
        &self,
        task_id: &TaskId,
        input: &TaskPayload,
    ) -> GraphResult<Option<TaskGraph>> {
        let _ = (task_id, input);
        Ok(None)
    }

    /// Runs the authoritative computation for one task.
    async fn execute(
        &self,
        input: &TaskPayload,
        ctx: &ExecutionContext,
    ) -> Result<TaskPayload, TaskError>;

    /// Recomputes a cheap view of the output from the current input and
    /// the last output, without side effects. Used by reactive runs and
    /// to refresh views on cache hits. Defaults to passing the last
    /// output through.
    async fn execute_reactive(
        &self,
        input: &TaskPayload,
        output: &TaskPayload,
        ctx: &ExecutionContext,
    ) -> Result<TaskPayload, TaskError> {
        let _ = (input, ctx);
        Ok(output.clone())
    }
}

/// Streaming notifications a task may raise while executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingEvent {
    /// The task began emitting a stream.
    Started,
    /// The task emitted one stream chunk.
    Chunk,
}

/// Callback hook the runner installs so streaming tasks can influence
/// downstream readiness.
#[derive(Clone)]
pub struct StreamingSignals {
    inner: Arc<dyn Fn(StreamingEvent) + Send + Sync>,
}

impl StreamingSignals {
    /// Wraps a callback invoked for every streaming notification.
    pub fn new(callback: impl Fn(StreamingEvent) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(callback),
        }
    }

    /// Signals that the task began streaming.
    pub fn started(&self) {
        (self.inner)(StreamingEvent::Started);
    }

    /// Signals that the task emitted a chunk.
    pub fn chunk(&self) {
        (self.inner)(StreamingEvent::Chunk);
    }
}

impl std::fmt::Debug for StreamingSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSignals").finish_non_exhaustive()
    }
}

/// Context handed to [`TaskKind::execute`].
///
/// Carries the run's abort signal, the provenance accumulated for the
/// task, the selected output cache, the compound sub-graph handle, and
/// progress/streaming reporters wired by the task record and the runner.
#[derive(Clone)]
pub struct ExecutionContext {
    run_id: RunId,
    signal: CancellationToken,
    provenance: Provenance,
    cache: Option<Arc<dyn OutputCache>>,
    subgraph: Option<TaskGraph>,
    progress: Option<ProgressReporter>,
    streaming: Option<StreamingSignals>,
}

impl ExecutionContext {
    /// Creates a context for a run.
    pub fn new(run_id: RunId, signal: CancellationToken, provenance: Provenance) -> Self {
        Self {
            run_id,
            signal,
            provenance,
            cache: None,
            subgraph: None,
            progress: None,
            streaming: None,
        }
    }

    /// Attaches the output cache selected for the run.
    pub fn with_cache(mut self, cache: Arc<dyn OutputCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attaches streaming signal hooks.
    pub fn with_streaming(mut self, streaming: StreamingSignals) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub(crate) fn with_subgraph(mut self, subgraph: Option<TaskGraph>) -> Self {
        self.subgraph = subgraph;
        self
    }

    pub(crate) fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the run identifier.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Returns the abort signal for this execution.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Returns whether cancellation has been requested.
    pub fn is_aborted(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Returns `Err(TaskError::Aborted)` when cancellation was requested.
    pub fn check_aborted(&self) -> Result<(), TaskError> {
        if self.is_aborted() {
            Err(TaskError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Returns the provenance accumulated for this task.
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Returns the output cache selected for the run, if any.
    pub fn cache(&self) -> Option<&Arc<dyn OutputCache>> {
        self.cache.as_ref()
    }

    /// Returns the compound sub-graph handle, if this task owns one.
    pub fn subgraph(&self) -> Option<&TaskGraph> {
        self.subgraph.as_ref()
    }

    /// Reports execution progress in `[0, 100]` with an optional message
    /// and structured details.
    pub fn update_progress(&self, progress: f32, message: Option<&str>, details: Option<Value>) {
        if let Some(reporter) = &self.progress {
            reporter.update(progress, message, details);
        }
    }

    /// Signals that this task began streaming output.
    pub fn report_stream_start(&self) {
        if let Some(streaming) = &self.streaming {
            streaming.started();
        }
    }

    /// Signals that this task emitted one streamed chunk.
    pub fn report_stream_chunk(&self) {
        if let Some(streaming) = &self.streaming {
            streaming.chunk();
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("aborted", &self.signal.is_cancelled())
            .field("has_cache", &self.cache.is_some())
            .field("has_subgraph", &self.subgraph.is_some())
            .finish_non_exhaustive()
    }
}
