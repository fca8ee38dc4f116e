//! brick-runtime - a pipeline runtime for brick-based automation mods

pub mod bricks;
pub mod cli;
pub mod core;
pub mod execution;
pub mod expression;
pub mod logging;
pub mod persistence;
pub mod store;

// Re-export commonly used types
pub use bricks::{Brick, BrickOptions, BrickRegistry, InMemoryBrickRegistry};
pub use core::{
    BrickConfig, Context, ExecutionStatus, Pipeline, PipelineDefinition, RunMetadata,
    RuntimeConfig,
};
pub use execution::{
    BrickError, Continuation, ExecutionEngine, ExecutionEvent, PipelineError, RunOutcome,
};
pub use expression::{Arg, Expression};
pub use store::{InMemoryStateStore, StateStore};
