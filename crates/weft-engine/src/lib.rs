#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod cache;
pub mod compound;
pub mod config;
mod error;
pub mod merge;
pub mod runner;
pub mod scheduler;

pub use cache::{InMemoryOutputCache, default_cache, set_default_cache};
pub use compound::{ReplicateKind, SubgraphKind};
pub use config::{CacheSelection, RunConfig};
pub use error::{EngineError, EngineResult, ErrorEntry, ErrorGroup};
pub use merge::{LeafResult, MergeStrategy, merge_leaves};
pub use runner::GraphRunner;
pub use scheduler::{DependencyScheduler, TaskScheduler, TopologicalScheduler};

/// Tracing target for engine operations.
pub const TRACING_TARGET: &str = "weft_engine";
