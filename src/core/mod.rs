//! Core domain models
//!
//! Pipelines, steps, contexts and run metadata, plus loading pipeline
//! definitions from configuration files.

pub mod condition;
pub mod config;
pub mod context;
pub mod pipeline;
pub mod state;
pub mod step;

pub use condition::{evaluate_guard, is_truthy};
pub use config::{ApiVersion, PipelineDefinition, RuntimeConfig};
pub use context::*;
pub use pipeline::*;
pub use state::*;
pub use step::*;
