//! Logging setup and the context-scoped logger handed to bricks

use crate::core::{Branch, BrickConfig, RunMetadata};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

/// Install the global fmt subscriber
///
/// `RUST_LOG` takes precedence over the verbosity flag.
pub fn init(verbose: bool) -> Result<()> {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;
    Ok(())
}

/// Structured logger scoped to a run and, optionally, a step
///
/// Serializable so it can travel with a continuation and be restored in the
/// environment that resumes the step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brick_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
}

impl LogContext {
    pub fn for_run(meta: &RunMetadata) -> Self {
        Self {
            run_id: meta.run_id,
            mod_id: meta.mod_id.clone(),
            branches: meta.branches.clone(),
            ..Default::default()
        }
    }

    /// Derive the context for a step invoked under `meta`
    pub fn child_for(&self, step: &BrickConfig, meta: &RunMetadata) -> Self {
        Self {
            run_id: meta.run_id.or(self.run_id),
            mod_id: meta.mod_id.clone().or_else(|| self.mod_id.clone()),
            brick_id: Some(step.id.clone()),
            instance_id: Some(step.instance_id),
            label: step.label.clone(),
            branches: meta.branches.clone(),
        }
    }

    fn branch_path(&self) -> String {
        self.branches
            .iter()
            .map(|b| format!("{}:{}", b.key, b.counter))
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn debug(&self, message: &str) {
        debug!(
            run_id = ?self.run_id,
            brick_id = self.brick_id.as_deref().unwrap_or(""),
            instance_id = ?self.instance_id,
            branches = %self.branch_path(),
            "{}",
            message
        );
    }

    pub fn info(&self, message: &str) {
        info!(
            run_id = ?self.run_id,
            brick_id = self.brick_id.as_deref().unwrap_or(""),
            instance_id = ?self.instance_id,
            branches = %self.branch_path(),
            "{}",
            message
        );
    }

    pub fn warn(&self, message: &str) {
        warn!(
            run_id = ?self.run_id,
            brick_id = self.brick_id.as_deref().unwrap_or(""),
            instance_id = ?self.instance_id,
            branches = %self.branch_path(),
            "{}",
            message
        );
    }

    pub fn error(&self, message: &str) {
        error!(
            run_id = ?self.run_id,
            brick_id = self.brick_id.as_deref().unwrap_or(""),
            instance_id = ?self.instance_id,
            branches = %self.branch_path(),
            "{}",
            message
        );
    }
}
