//! Pipeline execution engine

pub mod engine;
pub mod error;
pub mod executor;
pub mod handoff;
pub mod trace;

pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent, PipelineRunner};
pub use error::{
    BrickError, ErrorContext, ErrorKind, PipelineError, RunOutcome, SerializedError,
};
pub use executor::StepExecutor;
pub use handoff::Continuation;
pub use trace::{TraceEntry, TraceExit, TraceRecorder, TraceSink};
