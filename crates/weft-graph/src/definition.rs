//! Serializable graph definitions and the task type registry.
//!
//! Definitions are the JSON-friendly representation of a graph: a
//! `tasks` array plus a `dataflows` array, with compound tasks embedding
//! their sub-graph. Deserializing a definition needs a [`TaskRegistry`]
//! to resolve type names back to task kinds.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::dataflow::Dataflow;
use crate::error::{GraphError, GraphResult};
use crate::graph::TaskGraph;
use crate::payload::{Provenance, TaskPayload};
use crate::task::{Task, TaskId, TaskKindRef};

/// Serializable definition of a whole graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Task definitions, in insertion order.
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Dataflow definitions, in insertion order.
    #[serde(default)]
    pub dataflows: Vec<DataflowDefinition>,
}

/// Serializable definition of one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task id.
    pub id: TaskId,
    /// Task type name, resolved through a [`TaskRegistry`].
    #[serde(rename = "type")]
    pub type_name: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Input defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<TaskPayload>,
    /// The task's own provenance contribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    /// Embedded sub-graph for compound tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<Box<GraphDefinition>>,
}

/// Serializable definition of one dataflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataflowDefinition {
    /// Source task id.
    pub source_task_id: TaskId,
    /// Source port id.
    pub source_task_port_id: String,
    /// Target task id.
    pub target_task_id: TaskId,
    /// Target port id.
    pub target_task_port_id: String,
}

/// One upstream dependency in the display projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DependencyRef {
    /// Source task id.
    pub id: TaskId,
    /// Source output port id.
    pub output: String,
}

/// One or many dependencies feeding a single target port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyEntry {
    /// A single upstream source.
    One(DependencyRef),
    /// Multiple upstream sources fanning into one port.
    Many(Vec<DependencyRef>),
}

/// Display-oriented projection of a task and its upstream dependencies.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskDependencyProjection {
    /// Task id.
    pub id: TaskId,
    /// Task type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Target port id mapped to its upstream source(s).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, DependencyEntry>,
}

/// Maps task type names to shared task kinds for deserialization.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    kinds: HashMap<String, TaskKindRef>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind under its type name, replacing any previous one.
    pub fn register(&mut self, kind: TaskKindRef) -> &mut Self {
        self.kinds.insert(kind.type_name().to_owned(), kind);
        self
    }

    /// Resolves a type name to its kind.
    pub fn get(&self, type_name: &str) -> Option<TaskKindRef> {
        self.kinds.get(type_name).cloned()
    }

    /// Returns whether a type name is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.kinds.contains_key(type_name)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TaskRegistry").field("types", &names).finish()
    }
}

impl TaskGraph {
    /// Emits the serializable definition of this graph.
    ///
    /// Compound tasks embed the definition of their installed sub-graph.
    pub fn to_definition(&self) -> GraphDefinition {
        let tasks = self
            .tasks()
            .map(|task| TaskDefinition {
                id: task.id().clone(),
                type_name: task.type_name().to_owned(),
                name: task.name().map(str::to_owned),
                input: Some(task.defaults().clone()).filter(|input| !input.is_empty()),
                provenance: Some(task.provenance().clone())
                    .filter(|provenance| !provenance.is_empty()),
                subgraph: task
                    .subgraph()
                    .map(|subgraph| Box::new(subgraph.to_definition())),
            })
            .collect();

        let dataflows = self
            .dataflows()
            .iter()
            .map(|dataflow| DataflowDefinition {
                source_task_id: dataflow.source_task_id().clone(),
                source_task_port_id: dataflow.source_port_id().to_owned(),
                target_task_id: dataflow.target_task_id().clone(),
                target_task_port_id: dataflow.target_port_id().to_owned(),
            })
            .collect();

        GraphDefinition { tasks, dataflows }
    }

    /// Builds a graph from a definition, resolving task types through the
    /// registry.
    pub fn from_definition(
        definition: &GraphDefinition,
        registry: &TaskRegistry,
    ) -> GraphResult<Self> {
        let mut graph = Self::new();

        for task_def in &definition.tasks {
            let kind = registry
                .get(&task_def.type_name)
                .ok_or_else(|| GraphError::UnknownTaskType(task_def.type_name.clone()))?;

            let mut task = Task::new(task_def.id.clone(), kind);
            if let Some(name) = &task_def.name {
                task = task.with_name(name.clone());
            }
            if let Some(input) = &task_def.input {
                task = task.with_defaults(input.clone());
            }
            if let Some(provenance) = &task_def.provenance {
                task = task.with_provenance(provenance.clone());
            }

            let task = graph.add_task(task)?;
            if let Some(subgraph_def) = &task_def.subgraph {
                task.install_subgraph(Self::from_definition(subgraph_def, registry)?);
            }
        }

        for flow_def in &definition.dataflows {
            graph.add_dataflow(Dataflow::new(
                flow_def.source_task_id.clone(),
                flow_def.source_task_port_id.clone(),
                flow_def.target_task_id.clone(),
                flow_def.target_task_port_id.clone(),
            ))?;
        }

        Ok(graph)
    }

    /// Emits the dependency projection used by display tooling: each task
    /// with its target ports mapped to the upstream source(s) feeding
    /// them.
    pub fn to_dependency_projections(&self) -> Vec<TaskDependencyProjection> {
        self.tasks()
            .map(|task| {
                let mut by_port: BTreeMap<String, Vec<DependencyRef>> = BTreeMap::new();
                for dataflow in self.in_dataflows(task.id()) {
                    by_port
                        .entry(dataflow.target_port_id().to_owned())
                        .or_default()
                        .push(DependencyRef {
                            id: dataflow.source_task_id().clone(),
                            output: dataflow.source_port_id().to_owned(),
                        });
                }

                let dependencies = by_port
                    .into_iter()
                    .map(|(port, mut refs)| {
                        let entry = if refs.len() == 1 {
                            DependencyEntry::One(refs.remove(0))
                        } else {
                            DependencyEntry::Many(refs)
                        };
                        (port, entry)
                    })
                    .collect();

                TaskDependencyProjection {
                    id: task.id().clone(),
                    type_name: task.type_name().to_owned(),
                    dependencies,
                }
            })
            .collect()
    }
}
