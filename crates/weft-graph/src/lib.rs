#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod cache;
pub mod dataflow;
pub mod definition;
mod error;
pub mod events;
pub mod fingerprint;
pub mod graph;
pub mod payload;
pub mod task;

pub use cache::OutputCache;
pub use dataflow::{ALL_PORTS, Dataflow, DataflowId};
pub use definition::{DataflowDefinition, GraphDefinition, TaskDefinition, TaskRegistry};
pub use error::{GraphError, GraphResult, TaskError};
pub use events::{DataflowEvent, EventBus, GraphEvent, TaskEvent};
pub use graph::TaskGraph;
pub use payload::{Provenance, TaskPayload};
pub use task::{
    ExecutionContext, PortSchema, PortType, RunId, StreamingEvent, StreamingSignals, Task, TaskId,
    TaskKind, TaskKindRef, TaskSchema, TaskStatus,
};

/// Tracing target for graph-model operations.
pub const TRACING_TARGET: &str = "weft_graph";
