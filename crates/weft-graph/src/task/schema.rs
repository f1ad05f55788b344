//! Port schemas and input validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::error::{GraphError, GraphResult};
use crate::payload::TaskPayload;
use crate::task::TaskId;

/// Tracing target for schema validation.
const TRACING_TARGET: &str = "weft_graph::schema";

/// Declared value type of a port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    /// JSON number.
    Number,
    /// JSON string.
    String,
    /// JSON boolean.
    Boolean,
    /// Callable value; declared for parity with dynamic front-ends but
    /// not representable as payload data, so validation rejects it.
    Function,
    /// Any JSON value (polymorphic port).
    #[default]
    Any,
}

impl PortType {
    /// Returns whether `value` matches this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Function => false,
            Self::Any => true,
        }
    }
}

/// Declaration of a single input or output port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSchema {
    /// Port identifier, unique among the ports of one direction.
    pub id: String,
    /// Declared value type.
    #[serde(default)]
    pub value_type: PortType,
    /// Whether the port carries an array of values.
    #[serde(default)]
    pub is_array: bool,
    /// Whether a compound task fans out over this port's array values.
    #[serde(default)]
    pub replicate: bool,
    /// Default value; a port without a default is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PortSchema {
    /// Creates a port declaration with the given id and type.
    pub fn new(id: impl Into<String>, value_type: PortType) -> Self {
        Self {
            id: id.into(),
            value_type,
            is_array: false,
            replicate: false,
            default: None,
            name: None,
        }
    }

    /// Marks the port as carrying arrays.
    pub fn with_array(mut self) -> Self {
        self.is_array = true;
        self
    }

    /// Marks the port as a replicate fan-out port.
    pub fn with_replicate(mut self) -> Self {
        self.replicate = true;
        self
    }

    /// Sets the default value, making the port optional.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns whether a value must be supplied for this port.
    pub fn required(&self) -> bool {
        self.default.is_none()
    }

    /// Returns whether this port accepts array values.
    pub fn accepts_array(&self) -> bool {
        self.is_array || self.replicate
    }
}

/// Declared input and output ports of a task type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSchema {
    /// Input port declarations.
    #[serde(default)]
    pub inputs: Vec<PortSchema>,
    /// Output port declarations.
    #[serde(default)]
    pub outputs: Vec<PortSchema>,
}

impl TaskSchema {
    /// Creates a schema from input and output port lists.
    pub fn new(inputs: Vec<PortSchema>, outputs: Vec<PortSchema>) -> Self {
        Self { inputs, outputs }
    }

    /// Looks up an input port by id.
    pub fn input(&self, id: &str) -> Option<&PortSchema> {
        self.inputs.iter().find(|port| port.id == id)
    }

    /// Looks up an output port by id.
    pub fn output(&self, id: &str) -> Option<&PortSchema> {
        self.outputs.iter().find(|port| port.id == id)
    }

    /// Returns input ports declared with `replicate: true`.
    pub fn replicate_inputs(&self) -> impl Iterator<Item = &PortSchema> {
        self.inputs.iter().filter(|port| port.replicate)
    }

    /// Builds the default input payload from declared port defaults.
    pub fn default_input(&self) -> TaskPayload {
        self.inputs
            .iter()
            .filter_map(|port| {
                port.default
                    .as_ref()
                    .map(|value| (port.id.clone(), value.clone()))
            })
            .collect()
    }

    /// Validates `input` against the declared input ports.
    ///
    /// Every declared port is required unless it carries a default.
    /// Array (and replicate) ports accept arrays whose elements match the
    /// declared type; other ports accept a single matching value.
    /// Undeclared keys in `input` are ignored.
    pub fn validate_input(&self, task_id: &TaskId, input: &TaskPayload) -> GraphResult<()> {
        for port in &self.inputs {
            let value = match input.get(&port.id) {
                Some(value) => value,
                None => {
                    if port.required() {
                        return Err(invalid(task_id, format!("missing required input {}", port.id)));
                    }
                    continue;
                }
            };

            if port.value_type == PortType::Function {
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_id = %task_id,
                    port = %port.id,
                    "Function-typed ports cannot be validated as data"
                );
                return Err(invalid(
                    task_id,
                    format!("port {} declares an unvalidatable type", port.id),
                ));
            }

            let matches = match value {
                Value::Array(items) if port.accepts_array() => {
                    items.iter().all(|item| port.value_type.accepts(item))
                }
                value => port.value_type.accepts(value),
            };

            if !matches {
                return Err(invalid(
                    task_id,
                    format!("port {} expects {} values", port.id, port.value_type),
                ));
            }
        }

        Ok(())
    }
}

fn invalid(task_id: &TaskId, message: String) -> GraphError {
    GraphError::InvalidInput {
        task_id: task_id.clone(),
        message,
    }
}
