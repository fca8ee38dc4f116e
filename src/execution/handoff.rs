//! Continuation payload for renderer steps that must run elsewhere

use crate::core::{BrickConfig, Context, RunMetadata};
use crate::logging::LogContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Everything needed to resume a suspended renderer step in another environment
///
/// The arguments were rendered before suspension; resuming invokes the brick
/// with them as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    pub brick_id: String,
    pub instance_id: Uuid,
    pub step: BrickConfig,
    pub args: Value,
    pub context: Context,
    pub run: RunMetadata,
    pub log_context: LogContext,
}

impl Continuation {
    pub fn new(
        step: &BrickConfig,
        args: Value,
        context: &Context,
        run: &RunMetadata,
        log_context: LogContext,
    ) -> Self {
        Self {
            brick_id: step.id.clone(),
            instance_id: step.instance_id,
            step: step.clone(),
            args,
            context: context.clone(),
            run: run.clone(),
            log_context,
        }
    }
}
