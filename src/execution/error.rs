//! Error taxonomy of the runtime

use crate::core::{Branch, BrickConfig, ExecutionStatus, RunMetadata};
use crate::execution::handoff::Continuation;
use crate::expression::RenderErrors;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Where in a run an error happened
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub brick_id: String,
    pub instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
}

impl ErrorContext {
    pub fn new(step: &BrickConfig, meta: &RunMetadata) -> Self {
        Self {
            brick_id: step.id.clone(),
            instance_id: step.instance_id,
            run_id: meta.run_id,
            label: step.label.clone(),
            branches: meta.branches.clone(),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "'{}' ({})", label, self.brick_id),
            None => write!(f, "{}", self.brick_id),
        }
    }
}

/// Error returned by a brick implementation
#[derive(Debug, Error)]
pub enum BrickError {
    /// Domain failure reported by the brick
    #[error("{message}")]
    Business {
        message: String,
        details: Option<Value>,
    },

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A pipeline argument could not be decoded
    #[error("malformed pipeline: {0}")]
    MalformedPipeline(String),

    /// Rendering a deferred expression failed
    #[error("render error: {0}")]
    Render(RenderErrors),

    #[error("cancelled")]
    Cancelled,

    #[error("superseded: {0}")]
    Superseded(String),

    #[error("continuation requested for {}", .0.brick_id)]
    Continuation(Box<Continuation>),

    /// A nested pipeline failed; propagated unchanged
    #[error(transparent)]
    Pipeline(Box<PipelineError>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrickError {
    pub fn business(message: impl Into<String>) -> Self {
        BrickError::Business {
            message: message.into(),
            details: None,
        }
    }
}

impl From<PipelineError> for BrickError {
    fn from(error: PipelineError) -> Self {
        BrickError::Pipeline(Box::new(error))
    }
}

/// Error propagated by the pipeline reducer
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown brick '{}'", .context.brick_id)]
    UnknownBrick { context: ErrorContext },

    #[error("{context}: configuration error: {message}")]
    Configuration {
        context: ErrorContext,
        message: String,
    },

    #[error("{context}: {errors}")]
    Render {
        context: ErrorContext,
        errors: RenderErrors,
    },

    #[error("{context}: {source}")]
    Brick {
        context: ErrorContext,
        source: BrickError,
    },

    #[error("{context}: cancelled")]
    Cancelled { context: ErrorContext },

    #[error("{context}: superseded: {message}")]
    Superseded {
        context: ErrorContext,
        message: String,
    },

    /// Not a failure: the renderer at `brick_id` must resume elsewhere
    #[error("suspended at {}", .0.brick_id)]
    Suspended(Box<Continuation>),
}

/// Classification of errors for callers deciding how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Render,
    Business,
    Cancelled,
    Superseded,
    Continuation,
}

impl PipelineError {
    /// Map a brick's error onto the reducer's error type
    ///
    /// Nested pipeline errors come back unchanged so their context and kind
    /// survive any number of closure levels.
    pub fn from_brick(error: BrickError, context: ErrorContext) -> Self {
        match error {
            BrickError::Pipeline(inner) => *inner,
            BrickError::Cancelled => PipelineError::Cancelled { context },
            BrickError::Superseded(message) => PipelineError::Superseded { context, message },
            BrickError::Continuation(continuation) => PipelineError::Suspended(continuation),
            BrickError::MalformedPipeline(message) => {
                PipelineError::Configuration { context, message }
            }
            BrickError::Render(errors) => PipelineError::Render { context, errors },
            other => PipelineError::Brick {
                context,
                source: other,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnknownBrick { .. } | PipelineError::Configuration { .. } => {
                ErrorKind::Configuration
            }
            PipelineError::Render { .. } => ErrorKind::Render,
            PipelineError::Brick { .. } => ErrorKind::Business,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
            PipelineError::Superseded { .. } => ErrorKind::Superseded,
            PipelineError::Suspended(_) => ErrorKind::Continuation,
        }
    }

    /// A failure the brick itself reported, as opposed to invalid arguments
    /// or an internal error; only these can change on a later attempt
    pub fn is_business_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::Brick {
                source: BrickError::Business { .. },
                ..
            }
        )
    }

    /// Where the error happened; `None` for a suspension
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            PipelineError::UnknownBrick { context }
            | PipelineError::Configuration { context, .. }
            | PipelineError::Render { context, .. }
            | PipelineError::Brick { context, .. }
            | PipelineError::Cancelled { context }
            | PipelineError::Superseded { context, .. } => Some(context),
            PipelineError::Suspended(_) => None,
        }
    }

    pub fn continuation(&self) -> Option<&Continuation> {
        match self {
            PipelineError::Suspended(continuation) => Some(continuation),
            _ => None,
        }
    }

    /// Trace/wire representation
    pub fn serialize(&self) -> SerializedError {
        let (name, message, details) = match self {
            PipelineError::UnknownBrick { context } => (
                "UnknownBrickError",
                format!("unknown brick '{}'", context.brick_id),
                None,
            ),
            PipelineError::Configuration { message, .. } => {
                ("ConfigurationError", message.clone(), None)
            }
            PipelineError::Render { errors, .. } => (
                "RenderError",
                errors.to_string(),
                Some(Value::Array(
                    errors
                        .iter()
                        .map(|e| json!({"location": e.location, "message": e.kind.to_string()}))
                        .collect(),
                )),
            ),
            PipelineError::Brick { source, .. } => match source {
                BrickError::Business { message, details } => {
                    ("BusinessError", message.clone(), details.clone())
                }
                BrickError::InvalidArgs(message) => ("InputValidationError", message.clone(), None),
                other => ("Error", other.to_string(), None),
            },
            PipelineError::Cancelled { .. } => ("CancelError", "cancelled".to_string(), None),
            PipelineError::Superseded { message, .. } => {
                ("SupersededError", message.clone(), None)
            }
            PipelineError::Suspended(continuation) => (
                "ContinuationSignal",
                format!("{} must resume in a rendering environment", continuation.brick_id),
                None,
            ),
        };
        SerializedError {
            name: name.to_string(),
            message,
            details,
        }
    }
}

/// Error description recorded in trace exits and cache slots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl SerializedError {
    pub fn from_render(errors: &RenderErrors) -> Self {
        PipelineError::Render {
            context: ErrorContext::default(),
            errors: errors.clone(),
        }
        .serialize()
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// How a top-level run ended
///
/// Suspension and supersession are not failures; callers match on the
/// variant instead of inspecting error types.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Value),
    Suspended(Box<Continuation>),
    Cancelled(PipelineError),
    Superseded(PipelineError),
    Failed(PipelineError),
}

impl RunOutcome {
    pub fn from_result(result: Result<Value, PipelineError>) -> Self {
        match result {
            Ok(value) => RunOutcome::Completed(value),
            Err(PipelineError::Suspended(continuation)) => RunOutcome::Suspended(continuation),
            Err(error) => match error.kind() {
                ErrorKind::Cancelled => RunOutcome::Cancelled(error),
                ErrorKind::Superseded => RunOutcome::Superseded(error),
                _ => RunOutcome::Failed(error),
            },
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            RunOutcome::Completed(_) => ExecutionStatus::Completed,
            RunOutcome::Suspended(_) => ExecutionStatus::Suspended,
            RunOutcome::Cancelled(_) => ExecutionStatus::Cancelled,
            RunOutcome::Superseded(_) => ExecutionStatus::Superseded,
            RunOutcome::Failed(_) => ExecutionStatus::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            RunOutcome::Cancelled(error) | RunOutcome::Superseded(error) | RunOutcome::Failed(error) => {
                Some(error)
            }
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Value, PipelineError> {
        match self {
            RunOutcome::Completed(value) => Ok(value),
            RunOutcome::Suspended(continuation) => Err(PipelineError::Suspended(continuation)),
            RunOutcome::Cancelled(error) | RunOutcome::Superseded(error) | RunOutcome::Failed(error) => {
                Err(error)
            }
        }
    }
}
