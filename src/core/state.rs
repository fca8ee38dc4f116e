//! Execution state models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Overall run status, as reported to history and the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Every step settled and the run produced a value
    Completed,
    /// A step failed and the error propagated out of the pipeline
    Failed,
    /// The run was cancelled through its cancellation token
    Cancelled,
    /// A newer request superseded this one
    Superseded,
    /// A renderer step must resume in a different environment
    Suspended,
}

/// Marker distinguishing nested pipeline invocations at the same brick instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Branch {
    /// Name of the argument holding the invoked pipeline (e.g. `body`)
    pub key: String,

    /// Invocation counter (loop iteration, retry attempt, ...)
    pub counter: usize,
}

impl Branch {
    pub fn new(key: impl Into<String>, counter: usize) -> Self {
        Self {
            key: key.into(),
            counter,
        }
    }
}

/// Metadata threaded through every step of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Correlates all trace records of one top-level invocation. `None`
    /// disables tracing for the run.
    #[serde(default)]
    pub run_id: Option<Uuid>,

    /// Branch markers, outermost first
    #[serde(default)]
    pub branches: Vec<Branch>,

    /// Mod the pipeline belongs to; scopes mod-level shared state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_id: Option<String>,
}

impl RunMetadata {
    /// Metadata for a traced run with a fresh run id
    pub fn traced() -> Self {
        Self {
            run_id: Some(Uuid::new_v4()),
            ..Self::default()
        }
    }

    /// Metadata for a run that performs no trace reporting
    pub fn untraced() -> Self {
        Self::default()
    }

    pub fn with_mod_id(mut self, mod_id: impl Into<String>) -> Self {
        self.mod_id = Some(mod_id.into());
        self
    }

    pub fn tracing_enabled(&self) -> bool {
        self.run_id.is_some()
    }

    /// Metadata for a nested invocation, with `branch` appended
    pub fn with_branch(&self, branch: Branch) -> Self {
        let mut branches = self.branches.clone();
        branches.push(branch);
        Self {
            run_id: self.run_id,
            branches,
            mod_id: self.mod_id.clone(),
        }
    }
}

/// Phase of a single step, in the order the executor moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepPhase {
    Pending,
    GuardEvaluating,
    ArgsRendering,
    Invoking,
    Settled,
}

/// How a step settled, when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The brick ran and produced a value
    Completed { value: Value },
    /// The guard evaluated falsy; the brick was not invoked
    Skipped,
}

impl StepOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, StepOutcome::Skipped)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            StepOutcome::Completed { value } => Some(value),
            StepOutcome::Skipped => None,
        }
    }
}
