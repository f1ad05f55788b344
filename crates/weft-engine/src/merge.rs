//! Leaf-result merge strategies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::{Display, EnumString};

use weft_graph::{TaskId, TaskPayload};

use crate::error::{EngineError, EngineResult};

/// Rule selecting how the outputs of a graph's leaf tasks combine into
/// the run result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// The `data` of the last leaf.
    Last,
    /// The leaf sequence as-is: `[{id, type, data}, ...]`.
    #[default]
    Named,
    /// `{ "data": [data, ...] }`.
    UnorderedArray,
    /// Transpose: `{ key: [value-per-leaf] }` for every key present
    /// across leaves. Each column has one entry per leaf (`null` where a
    /// leaf lacks the key), so `column[i]` always belongs to leaf `i`.
    PropertyArray,
    /// `last` when exactly one leaf, else `named`.
    LastOrNamed,
    /// `last` when exactly one leaf, else `unordered-array`.
    LastOrUnorderedArray,
    /// `last` when exactly one leaf, else `property-array`.
    LastOrPropertyArray,
}

impl MergeStrategy {
    /// Parses a strategy from its string form.
    ///
    /// Unknown strategies are a configuration error.
    pub fn parse(value: &str) -> EngineResult<Self> {
        value
            .parse()
            .map_err(|_| EngineError::Configuration(format!("unknown merge strategy {value}")))
    }
}

/// Output of one leaf task, in graph insertion order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeafResult {
    /// Leaf task id.
    pub id: TaskId,
    /// Leaf task type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Leaf task output.
    pub data: TaskPayload,
}

/// Merges an ordered sequence of leaf results per the strategy table.
pub fn merge_leaves(strategy: MergeStrategy, leaves: &[LeafResult]) -> Value {
    match strategy {
        MergeStrategy::Last => leaves
            .last()
            .map(|leaf| Value::Object(leaf.data.clone()))
            .unwrap_or_else(|| Value::Object(Map::new())),
        MergeStrategy::Named => Value::Array(
            leaves
                .iter()
                .map(|leaf| json!({ "id": leaf.id, "type": leaf.type_name, "data": leaf.data }))
                .collect(),
        ),
        MergeStrategy::UnorderedArray => {
            json!({ "data": leaves.iter().map(|leaf| leaf.data.clone()).collect::<Vec<_>>() })
        }
        MergeStrategy::PropertyArray => {
            let mut keys: Vec<&String> = Vec::new();
            for leaf in leaves {
                for key in leaf.data.keys() {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }

            // One column entry per leaf, null-padded where a leaf lacks
            // the key, so positions line up with the leaf sequence.
            let transposed: Map<String, Value> = keys
                .into_iter()
                .map(|key| {
                    let column = leaves
                        .iter()
                        .map(|leaf| leaf.data.get(key).cloned().unwrap_or(Value::Null))
                        .collect();
                    (key.clone(), Value::Array(column))
                })
                .collect();
            Value::Object(transposed)
        }
        MergeStrategy::LastOrNamed
        | MergeStrategy::LastOrUnorderedArray
        | MergeStrategy::LastOrPropertyArray => {
            let fallback = match strategy {
                MergeStrategy::LastOrNamed => MergeStrategy::Named,
                MergeStrategy::LastOrUnorderedArray => MergeStrategy::UnorderedArray,
                _ => MergeStrategy::PropertyArray,
            };
            if leaves.len() == 1 {
                merge_leaves(MergeStrategy::Last, leaves)
            } else {
                merge_leaves(fallback, leaves)
            }
        }
    }
}
