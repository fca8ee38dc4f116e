//! Trace records and the fire-and-forget recorder

use crate::core::{Branch, BrickConfig, Context, RunMetadata};
use crate::execution::error::SerializedError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

// A present `null` stays `Some(Value::Null)`
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Recorded when a step starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub run_id: Uuid,
    pub brick_instance_id: Uuid,
    pub brick_id: String,
    pub branches: Vec<Branch>,
    pub timestamp: DateTime<Utc>,
    pub brick_config: BrickConfig,
    /// Context visible to the step before rendering
    pub template_context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub rendered_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_error: Option<SerializedError>,
}

impl TraceEntry {
    pub fn new(run_id: Uuid, step: &BrickConfig, meta: &RunMetadata, ctx: &Context) -> Self {
        Self {
            run_id,
            brick_instance_id: step.instance_id,
            brick_id: step.id.clone(),
            branches: meta.branches.clone(),
            timestamp: Utc::now(),
            brick_config: step.clone(),
            template_context: ctx.clone(),
            rendered_args: None,
            render_error: None,
        }
    }
}

/// Recorded when a step settles or is skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceExit {
    pub run_id: Uuid,
    pub brick_instance_id: Uuid,
    pub brick_id: String,
    pub branches: Vec<Branch>,
    pub timestamp: DateTime<Utc>,
    pub skipped_run: bool,
    pub is_renderer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl TraceExit {
    pub fn new(run_id: Uuid, step: &BrickConfig, meta: &RunMetadata) -> Self {
        Self {
            run_id,
            brick_instance_id: step.instance_id,
            brick_id: step.id.clone(),
            branches: meta.branches.clone(),
            timestamp: Utc::now(),
            skipped_run: false,
            is_renderer: false,
            output: None,
            output_key: step.output_key.as_ref().map(|k| k.to_string()),
            error: None,
        }
    }

    /// Whether the step ended in an error
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Destination for trace records
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn add_entry(&self, entry: TraceEntry) -> Result<()>;

    async fn add_exit(&self, exit: TraceExit) -> Result<()>;
}

enum TraceCommand {
    Entry(Box<TraceEntry>),
    Exit(Box<TraceExit>),
    Flush(oneshot::Sender<()>),
}

/// Forwards trace records to a sink from a background task
///
/// Recording never waits on the sink. Records reach the sink in the order
/// they were recorded; sink failures are logged and dropped.
#[derive(Clone)]
pub struct TraceRecorder {
    tx: mpsc::UnboundedSender<TraceCommand>,
}

impl TraceRecorder {
    /// Start the forwarding task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn TraceSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceCommand>();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    TraceCommand::Entry(entry) => {
                        let instance = entry.brick_instance_id;
                        if let Err(e) = sink.add_entry(*entry).await {
                            warn!("Failed to record trace entry for {}: {:#}", instance, e);
                        }
                    }
                    TraceCommand::Exit(exit) => {
                        let instance = exit.brick_instance_id;
                        if let Err(e) = sink.add_exit(*exit).await {
                            warn!("Failed to record trace exit for {}: {:#}", instance, e);
                        }
                    }
                    TraceCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Trace recorder stopped");
        });

        Self { tx }
    }

    pub fn add_entry(&self, entry: TraceEntry) {
        if self.tx.send(TraceCommand::Entry(Box::new(entry))).is_err() {
            warn!("Trace recorder is closed; dropping entry");
        }
    }

    pub fn add_exit(&self, exit: TraceExit) {
        if self.tx.send(TraceCommand::Exit(Box::new(exit))).is_err() {
            warn!("Trace recorder is closed; dropping exit");
        }
    }

    /// Wait until every record sent so far has been handed to the sink
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(TraceCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}
