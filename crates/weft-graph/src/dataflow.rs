//! Dataflow edges carrying values, status and provenance between tasks.

use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use derive_more::{Debug as DeriveDebug, Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;
use crate::events::{DataflowEvent, EventBus};
use crate::payload::{Provenance, TaskPayload};
use crate::task::{TaskId, TaskStatus};

/// Wildcard port token: copy the entire source output object into the
/// target's input map instead of a single port value.
pub const ALL_PORTS: &str = "*";

/// Identifier of a dataflow, derived deterministically from its four
/// endpoints as `"{source}.{sourcePort} -> {target}.{targetPort}"`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(DeriveDebug, Display, From, Into)]
#[debug("{_0}")]
#[display("{_0}")]
#[serde(transparent)]
pub struct DataflowId(String);

impl DataflowId {
    /// Composes the id from the four endpoint identifiers.
    pub fn compose(
        source_task_id: &TaskId,
        source_port_id: &str,
        target_task_id: &TaskId,
        target_port_id: &str,
    ) -> Self {
        Self(format!(
            "{source_task_id}.{source_port_id} -> {target_task_id}.{target_port_id}"
        ))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DataflowId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl FromStr for DataflowId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

/// Live state carried by a dataflow during a run.
#[derive(Clone, Debug, Default)]
struct DataflowState {
    value: Option<Value>,
    provenance: Provenance,
    status: TaskStatus,
    error: Option<TaskError>,
}

/// A directed connection from a source task's output port to a target
/// task's input port.
///
/// Besides its endpoints, a dataflow carries the latest value pushed from
/// the source output, the provenance accumulated up to the source, and a
/// status/error mirror of the source task, updated by the runner.
#[derive(Debug)]
pub struct Dataflow {
    id: DataflowId,
    source_task_id: TaskId,
    source_port_id: String,
    target_task_id: TaskId,
    target_port_id: String,
    state: RwLock<DataflowState>,
    events: EventBus<DataflowEvent>,
}

impl Dataflow {
    /// Creates a dataflow between two task ports.
    pub fn new(
        source_task_id: impl Into<TaskId>,
        source_port_id: impl Into<String>,
        target_task_id: impl Into<TaskId>,
        target_port_id: impl Into<String>,
    ) -> Self {
        let source_task_id = source_task_id.into();
        let source_port_id = source_port_id.into();
        let target_task_id = target_task_id.into();
        let target_port_id = target_port_id.into();

        Self {
            id: DataflowId::compose(
                &source_task_id,
                &source_port_id,
                &target_task_id,
                &target_port_id,
            ),
            source_task_id,
            source_port_id,
            target_task_id,
            target_port_id,
            state: RwLock::new(DataflowState::default()),
            events: EventBus::new(),
        }
    }

    /// Returns the dataflow id.
    pub fn id(&self) -> &DataflowId {
        &self.id
    }

    /// Returns the source task id.
    pub fn source_task_id(&self) -> &TaskId {
        &self.source_task_id
    }

    /// Returns the source port id.
    pub fn source_port_id(&self) -> &str {
        &self.source_port_id
    }

    /// Returns the target task id.
    pub fn target_task_id(&self) -> &TaskId {
        &self.target_task_id
    }

    /// Returns the target port id.
    pub fn target_port_id(&self) -> &str {
        &self.target_port_id
    }

    /// Returns the latest value pushed onto this dataflow, if any.
    pub fn value(&self) -> Option<Value> {
        self.read().value.clone()
    }

    /// Returns the provenance carried by this dataflow.
    pub fn provenance(&self) -> Provenance {
        self.read().provenance.clone()
    }

    /// Returns the mirrored status of the source task.
    pub fn status(&self) -> TaskStatus {
        self.read().status
    }

    /// Returns the mirrored error of the source task, if it failed.
    pub fn error(&self) -> Option<TaskError> {
        self.read().error.clone()
    }

    /// Returns the event bus for this dataflow.
    pub fn events(&self) -> &EventBus<DataflowEvent> {
        &self.events
    }

    /// Returns the partial input contribution this dataflow makes to its
    /// target: `{ targetPort: value }`, or the entire value object for the
    /// [`ALL_PORTS`] wildcard. Empty when no value has been pushed yet.
    pub fn port_data(&self) -> TaskPayload {
        let state = self.read();
        let Some(value) = &state.value else {
            return TaskPayload::new();
        };

        if self.target_port_id == ALL_PORTS {
            match value {
                Value::Object(map) => map.clone(),
                _ => TaskPayload::new(),
            }
        } else {
            let mut payload = TaskPayload::new();
            payload.insert(self.target_port_id.clone(), value.clone());
            payload
        }
    }

    /// Stores the source output's contribution on this dataflow and
    /// replaces the carried provenance.
    ///
    /// Reads `output[sourcePort]`, or the whole output object for the
    /// [`ALL_PORTS`] wildcard.
    pub fn set_port_data(&self, output: &TaskPayload, provenance: &Provenance) {
        let value = if self.source_port_id == ALL_PORTS {
            Some(Value::Object(output.clone()))
        } else {
            output.get(&self.source_port_id).cloned()
        };

        let mut state = self.write();
        state.value = value;
        state.provenance = provenance.clone();
    }

    /// Mirrors the source task's status (and error, when failed) onto
    /// this dataflow and emits the matching event.
    pub fn set_status(&self, status: TaskStatus, error: Option<TaskError>) {
        {
            let mut state = self.write();
            state.status = status;
            state.error = error.clone();
        }

        let dataflow_id = self.id.clone();
        match status {
            TaskStatus::Processing => self.events.emit(DataflowEvent::Start { dataflow_id }),
            TaskStatus::Completed => self.events.emit(DataflowEvent::Complete { dataflow_id }),
            TaskStatus::Aborting => self.events.emit(DataflowEvent::Abort { dataflow_id }),
            TaskStatus::Pending => self.events.emit(DataflowEvent::Reset { dataflow_id }),
            TaskStatus::Skipped => self.events.emit(DataflowEvent::Skipped { dataflow_id }),
            TaskStatus::Failed => self.events.emit(DataflowEvent::Error {
                dataflow_id,
                error: error.unwrap_or_else(|| TaskError::failed("source task failed")),
            }),
        }
    }

    /// Clears value, provenance, status and error for a new run.
    pub fn clear(&self) {
        {
            let mut state = self.write();
            state.value = None;
            state.provenance = Provenance::new();
            state.error = None;
            state.status = TaskStatus::Pending;
        }
        self.events.emit(DataflowEvent::Reset {
            dataflow_id: self.id.clone(),
        });
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DataflowState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DataflowState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::payload::payload_from;

    #[test]
    fn test_id_composition() {
        let flow = Dataflow::new("task1", "output", "task3", "a");
        assert_eq!(flow.id().as_str(), "task1.output -> task3.a");
    }

    #[test]
    fn test_port_data_single_port() {
        let flow = Dataflow::new("a", "output", "b", "input");
        assert!(flow.port_data().is_empty());

        let output = payload_from([("output", json!(25)), ("extra", json!("x"))]);
        flow.set_port_data(&output, &Provenance::new());

        assert_eq!(flow.value(), Some(json!(25)));
        assert_eq!(flow.port_data(), payload_from([("input", json!(25))]));
    }

    #[test]
    fn test_all_ports_copies_whole_object() {
        let flow = Dataflow::new("a", ALL_PORTS, "b", ALL_PORTS);
        let output = payload_from([("x", json!(1)), ("y", json!(2))]);
        flow.set_port_data(&output, &Provenance::new());

        assert_eq!(flow.value(), Some(Value::Object(output.clone())));
        assert_eq!(flow.port_data(), output);
    }

    #[test]
    fn test_missing_source_port_clears_value() {
        let flow = Dataflow::new("a", "nope", "b", "input");
        flow.set_port_data(&payload_from([("output", json!(1))]), &Provenance::new());
        assert_eq!(flow.value(), None);
        assert!(flow.port_data().is_empty());
    }

    #[test]
    fn test_status_mirror_and_events() {
        let flow = Dataflow::new("a", "output", "b", "input");
        let mut rx = flow.events().subscribe();

        flow.set_status(TaskStatus::Processing, None);
        flow.set_status(TaskStatus::Failed, Some(TaskError::failed("boom")));

        assert_eq!(flow.status(), TaskStatus::Failed);
        assert_eq!(flow.error(), Some(TaskError::failed("boom")));

        assert!(matches!(rx.try_recv(), Ok(DataflowEvent::Start { .. })));
        assert!(matches!(rx.try_recv(), Ok(DataflowEvent::Error { .. })));
    }

    #[test]
    fn test_clear_resets_state() {
        let flow = Dataflow::new("a", "output", "b", "input");
        flow.set_port_data(&payload_from([("output", json!(1))]), &Provenance::new());
        flow.set_status(TaskStatus::Completed, None);

        flow.clear();

        assert_eq!(flow.value(), None);
        assert_eq!(flow.status(), TaskStatus::Pending);
        assert_eq!(flow.error(), None);
    }
}
