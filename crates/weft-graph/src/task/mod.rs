//! Task records: one unit of computation with schema, state and events.

use std::sync::{Arc, PoisonError, RwLock};

use jiff::Timestamp;
use serde_json::Value;

use crate::dataflow::ALL_PORTS;
use crate::error::{GraphResult, TaskError};
use crate::events::{EventBus, TaskEvent};
use crate::graph::TaskGraph;
use crate::payload::{Provenance, TaskPayload, merge_shallow};

mod id;
mod kind;
mod schema;
mod status;

pub use id::{RunId, TaskId};
pub use kind::{ExecutionContext, StreamingEvent, StreamingSignals, TaskKind, TaskKindRef};
pub use schema::{PortSchema, PortType, TaskSchema};
pub use status::TaskStatus;

/// Tracing target for task lifecycle operations.
const TRACING_TARGET: &str = "weft_graph::task";

/// Mutable per-run state of a task.
#[derive(Clone, Debug)]
pub struct TaskState {
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Progress in `[0, 100]`.
    pub progress: f32,
    /// Effective input for the current run.
    pub run_input: TaskPayload,
    /// Output of the last completed run, if any.
    pub output: Option<TaskPayload>,
    /// Error from the last failed run, if any.
    pub error: Option<TaskError>,
    /// When the task record was created.
    pub created_at: Timestamp,
    /// When the current run started processing.
    pub started_at: Option<Timestamp>,
    /// When the current run finished.
    pub completed_at: Option<Timestamp>,
    /// Run this task currently belongs to.
    pub run_id: Option<RunId>,
}

impl TaskState {
    fn new(run_input: TaskPayload) -> Self {
        Self {
            status: TaskStatus::Pending,
            progress: 0.0,
            run_input,
            output: None,
            error: None,
            created_at: Timestamp::now(),
            started_at: None,
            completed_at: None,
            run_id: None,
        }
    }
}

/// Emits task progress events on behalf of an execution context.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    task_id: TaskId,
    state: Arc<RwLock<TaskState>>,
    events: EventBus<TaskEvent>,
}

impl ProgressReporter {
    pub(crate) fn update(&self, progress: f32, message: Option<&str>, details: Option<Value>) {
        let progress = progress.clamp(0.0, 100.0);
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.progress = progress;
        }
        self.events.emit(TaskEvent::Progress {
            task_id: self.task_id.clone(),
            progress,
            message: message.map(str::to_owned),
            details,
        });
    }
}

/// One unit of computation in a task graph.
///
/// A task pairs a shared [`TaskKind`] with per-task identity, input
/// defaults, provenance contribution, and interior run state. Graphs hold
/// tasks behind `Arc`, so state observed through any handle is live.
pub struct Task {
    id: TaskId,
    name: Option<String>,
    kind: TaskKindRef,
    cacheable: bool,
    provenance: Provenance,
    defaults: TaskPayload,
    state: Arc<RwLock<TaskState>>,
    subgraph: RwLock<Option<TaskGraph>>,
    events: EventBus<TaskEvent>,
}

impl Task {
    /// Creates a task of the given kind.
    ///
    /// Input defaults start from the schema's declared port defaults; the
    /// run-input starts as a copy of the defaults.
    pub fn new(id: impl Into<TaskId>, kind: TaskKindRef) -> Self {
        let defaults = kind.schema().default_input();
        let cacheable = kind.cacheable();
        Self {
            id: id.into(),
            name: None,
            kind,
            cacheable,
            provenance: Provenance::new(),
            state: Arc::new(RwLock::new(TaskState::new(defaults.clone()))),
            defaults,
            subgraph: RwLock::new(None),
            events: EventBus::new(),
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Merges input defaults over the schema's declared defaults and
    /// resets the run-input to match.
    pub fn with_defaults(mut self, defaults: TaskPayload) -> Self {
        merge_shallow(&mut self.defaults, &defaults);
        self.write().run_input = self.defaults.clone();
        self
    }

    /// Sets this task's own provenance contribution.
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Overrides whether this task participates in output caching.
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Returns the task id.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Returns the display name, if set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the task kind.
    pub fn kind(&self) -> &TaskKindRef {
        &self.kind
    }

    /// Returns the kind's type name.
    pub fn type_name(&self) -> &str {
        self.kind.type_name()
    }

    /// Returns whether this task owns a sub-graph.
    pub fn is_compound(&self) -> bool {
        self.kind.is_compound()
    }

    /// Returns whether cache lookups and writes are enabled.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Returns this task's own provenance contribution.
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Returns the input defaults.
    pub fn defaults(&self) -> &TaskPayload {
        &self.defaults
    }

    /// Returns the current status.
    pub fn status(&self) -> TaskStatus {
        self.read().status
    }

    /// Returns the current progress in `[0, 100]`.
    pub fn progress(&self) -> f32 {
        self.read().progress
    }

    /// Returns a copy of the effective run-input.
    pub fn run_input(&self) -> TaskPayload {
        self.read().run_input.clone()
    }

    /// Returns the last run output, if any.
    pub fn output(&self) -> Option<TaskPayload> {
        self.read().output.clone()
    }

    /// Returns the last error, if any.
    pub fn error(&self) -> Option<TaskError> {
        self.read().error.clone()
    }

    /// Returns the run this task currently belongs to, if any.
    pub fn run_id(&self) -> Option<RunId> {
        self.read().run_id
    }

    /// Returns a snapshot of the full task state.
    pub fn state(&self) -> TaskState {
        self.read().clone()
    }

    /// Returns the event bus for this task.
    pub fn events(&self) -> &EventBus<TaskEvent> {
        &self.events
    }

    /// Returns a handle to the compound sub-graph, if one is installed.
    pub fn subgraph(&self) -> Option<TaskGraph> {
        self.subgraph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs a sub-graph handle, replacing any existing one.
    pub fn install_subgraph(&self, graph: TaskGraph) {
        *self
            .subgraph
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(graph);
    }

    /// Merges input overrides into the run-input.
    ///
    /// Per declared input key: when the port is declared `is_array`, or
    /// either side is already an array on an `any`-typed port, values are
    /// appended into an array; otherwise the override replaces. The
    /// [`ALL_PORTS`] key shallow-merges an override object. Returns
    /// whether the run-input actually changed; a change on a compound
    /// task regenerates its sub-graph.
    pub fn set_input(&self, overrides: &TaskPayload) -> GraphResult<bool> {
        let schema = self.kind.schema();
        let changed = {
            let mut state = self.write();
            let before = state.run_input.clone();

            for (key, value) in overrides {
                if key == ALL_PORTS {
                    match value {
                        Value::Object(map) => merge_shallow(&mut state.run_input, map),
                        other => {
                            tracing::warn!(
                                target: TRACING_TARGET,
                                task_id = %self.id,
                                value_type = ?other,
                                "Wildcard input override is not an object; ignoring"
                            );
                        }
                    }
                    continue;
                }

                let append = match schema.input(key) {
                    Some(port) if port.is_array => true,
                    Some(port) if port.value_type == PortType::Any => {
                        value.is_array()
                            || state.run_input.get(key).is_some_and(Value::is_array)
                    }
                    _ => false,
                };

                if append {
                    let mut items = match state.run_input.remove(key) {
                        Some(Value::Array(items)) => items,
                        Some(existing) => vec![existing],
                        None => Vec::new(),
                    };
                    match value {
                        Value::Array(new_items) => items.extend(new_items.iter().cloned()),
                        scalar => items.push(scalar.clone()),
                    }
                    state.run_input.insert(key.clone(), Value::Array(items));
                } else {
                    state.run_input.insert(key.clone(), value.clone());
                }
            }

            state.run_input != before
        };

        if changed && self.is_compound() {
            self.regenerate_subgraph()?;
        }

        Ok(changed)
    }

    /// Removes one port's value from the run-input.
    pub fn remove_input(&self, port_id: &str) -> Option<Value> {
        self.write().run_input.remove(port_id)
    }

    /// Restores the run-input from the input defaults.
    pub fn reset_input(&self) {
        self.write().run_input = self.defaults.clone();
    }

    /// Validates the current run-input against the declared schema.
    pub fn validate_input(&self) -> GraphResult<()> {
        let input = self.run_input();
        self.kind.schema().validate_input(&self.id, &input)
    }

    /// Rebuilds the compound sub-graph from the current run-input.
    ///
    /// Returns whether a new sub-graph was installed. Non-compound tasks
    /// and kinds that return no graph are a no-op.
    pub fn regenerate_subgraph(&self) -> GraphResult<bool> {
        if !self.is_compound() {
            return Ok(false);
        }
        let input = self.run_input();
        match self.kind.build_subgraph(&self.id, &input)? {
            Some(graph) => {
                self.install_subgraph(graph);
                self.events.emit(TaskEvent::Regenerate {
                    task_id: self.id.clone(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resets the task to pending for a new run.
    ///
    /// Clears output, error, progress and timestamps, and installs the
    /// run id. The run-input is preserved so inputs staged before the run
    /// (replicate arrays in particular) survive.
    pub fn reset(&self, run_id: RunId) {
        {
            let mut state = self.write();
            state.status = TaskStatus::Pending;
            state.progress = 0.0;
            state.output = None;
            state.error = None;
            state.started_at = None;
            state.completed_at = None;
            state.run_id = Some(run_id);
        }
        self.events.emit(TaskEvent::Reset {
            task_id: self.id.clone(),
        });
    }

    /// Requests cancellation: transitions a processing task to aborting.
    pub fn abort(&self) {
        let transitioned = {
            let mut state = self.write();
            if state.status.can_transition_to(TaskStatus::Aborting) {
                state.status = TaskStatus::Aborting;
                state.error = Some(TaskError::Aborted);
                true
            } else {
                false
            }
        };
        if transitioned {
            self.events.emit(TaskEvent::Abort {
                task_id: self.id.clone(),
            });
        }
    }

    /// Marks a still-pending task as skipped.
    pub fn skip(&self) {
        let transitioned = {
            let mut state = self.write();
            if state.status == TaskStatus::Pending {
                state.status = TaskStatus::Skipped;
                true
            } else {
                false
            }
        };
        if transitioned {
            self.events.emit(TaskEvent::Skipped {
                task_id: self.id.clone(),
            });
        }
    }

    /// Drives a full execution of this task.
    ///
    /// Merges `overrides`, validates the input, consults the output cache
    /// when the task is cacheable and the context carries one, invokes
    /// [`TaskKind::execute`] (or serves the cached output through
    /// [`TaskKind::execute_reactive`] on a hit), persists new outputs to
    /// the cache, transitions state and emits lifecycle events.
    pub async fn run_full(
        &self,
        overrides: Option<&TaskPayload>,
        ctx: &ExecutionContext,
    ) -> Result<TaskPayload, TaskError> {
        if self.status() != TaskStatus::Pending {
            self.reset(ctx.run_id());
        } else {
            self.write().run_id = Some(ctx.run_id());
        }

        self.begin();

        if let Some(overrides) = overrides
            && let Err(err) = self.set_input(overrides)
        {
            let err = TaskError::failed(err.to_string());
            self.fail(err.clone());
            return Err(err);
        }

        if let Err(err) = self.validate_input() {
            let err = TaskError::InvalidInput(err.to_string());
            self.fail(err.clone());
            return Err(err);
        }

        let input = self.run_input();
        let mut exec_ctx = ctx.clone().with_progress(self.progress_reporter());
        if self.is_compound() {
            if self.subgraph().is_none()
                && let Err(err) = self.regenerate_subgraph()
            {
                let err = TaskError::failed(err.to_string());
                self.fail(err.clone());
                return Err(err);
            }
            exec_ctx = exec_ctx.with_subgraph(self.subgraph());
        }

        if self.cacheable
            && let Some(cache) = exec_ctx.cache()
            && let Some(cached) = cache.get_output(self.type_name(), &input).await
        {
            tracing::debug!(
                target: TRACING_TARGET,
                task_id = %self.id,
                task_type = self.type_name(),
                "Serving task output from cache"
            );
            let output = match self
                .kind
                .execute_reactive(&input, &cached, &exec_ctx)
                .await
            {
                Ok(output) => output,
                Err(_) => cached,
            };
            self.complete(output.clone());
            return Ok(output);
        }

        if exec_ctx.is_aborted() {
            self.mark_aborted();
            return Err(TaskError::Aborted);
        }

        match self.kind.execute(&input, &exec_ctx).await {
            Ok(output) => {
                if self.cacheable
                    && let Some(cache) = exec_ctx.cache()
                {
                    cache.save_output(self.type_name(), &input, &output).await;
                }
                self.complete(output.clone());
                Ok(output)
            }
            Err(err) if err.is_abort() => {
                self.mark_aborted();
                Err(err)
            }
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Drives a reactive pass: recomputes the output view from the
    /// current input and the last output.
    ///
    /// Never consults the cache and never transitions the task status.
    pub async fn run_reactive(
        &self,
        overrides: Option<&TaskPayload>,
        ctx: &ExecutionContext,
    ) -> Result<TaskPayload, TaskError> {
        if let Some(overrides) = overrides {
            self.set_input(overrides)
                .map_err(|err| TaskError::failed(err.to_string()))?;
        }

        let input = self.run_input();
        let last_output = self.output().unwrap_or_default();
        let mut exec_ctx = ctx.clone().with_progress(self.progress_reporter());
        if self.is_compound() {
            exec_ctx = exec_ctx.with_subgraph(self.subgraph());
        }

        let output = self
            .kind
            .execute_reactive(&input, &last_output, &exec_ctx)
            .await?;
        self.write().output = Some(output.clone());
        Ok(output)
    }

    fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter {
            task_id: self.id.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        }
    }

    fn begin(&self) {
        {
            let mut state = self.write();
            state.status = TaskStatus::Processing;
            state.started_at = Some(Timestamp::now());
        }
        self.events.emit(TaskEvent::Start {
            task_id: self.id.clone(),
        });
    }

    fn complete(&self, output: TaskPayload) {
        let transitioned = {
            let mut state = self.write();
            state.output = Some(output);
            if state.status.can_transition_to(TaskStatus::Completed) {
                state.status = TaskStatus::Completed;
                state.progress = 100.0;
                state.error = None;
                state.completed_at = Some(Timestamp::now());
                true
            } else {
                false
            }
        };
        if transitioned {
            self.events.emit(TaskEvent::Complete {
                task_id: self.id.clone(),
            });
        }
    }

    fn fail(&self, error: TaskError) {
        {
            let mut state = self.write();
            state.status = TaskStatus::Failed;
            state.error = Some(error.clone());
            state.completed_at = Some(Timestamp::now());
        }
        self.events.emit(TaskEvent::Error {
            task_id: self.id.clone(),
            error,
        });
    }

    fn mark_aborted(&self) {
        self.abort();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TaskState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TaskState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("type", &self.type_name())
            .field("status", &self.status())
            .field("compound", &self.is_compound())
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}
