//! Main execution engine - reduces a pipeline step by step

use crate::{
    bricks::BrickRegistry,
    core::{Context, ExecutionStatus, Pipeline, RunMetadata, RuntimeConfig, StepOutcome},
    execution::{
        error::{ErrorKind, PipelineError, RunOutcome},
        handoff::Continuation,
        trace::{TraceRecorder, TraceSink},
        StepExecutor,
    },
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
///
/// `depth` is the number of branch markers on the step, zero for top-level
/// steps.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Option<Uuid>,
        steps: usize,
    },
    StepStarted {
        instance_id: Uuid,
        brick_id: String,
        label: Option<String>,
        depth: usize,
    },
    StepSkipped {
        instance_id: Uuid,
        brick_id: String,
        depth: usize,
    },
    StepCompleted {
        instance_id: Uuid,
        brick_id: String,
        output: Value,
        depth: usize,
    },
    StepFailed {
        instance_id: Uuid,
        brick_id: String,
        error: String,
        kind: ErrorKind,
        depth: usize,
    },
    RunFinished {
        run_id: Option<Uuid>,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct EventBus {
    handlers: Vec<EventHandler>,
}

impl EventBus {
    /// Build the event only when someone is listening
    pub(crate) fn emit(&self, event: impl FnOnce() -> ExecutionEvent) {
        if self.handlers.is_empty() {
            return;
        }
        let event = event();
        for handler in &self.handlers {
            handler(event.clone());
        }
    }
}

/// Runs a pipeline on behalf of a brick
///
/// Bricks that take pipeline arguments call back into the engine through
/// this trait rather than holding the engine directly.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        ctx: Context,
        meta: RunMetadata,
        cancel: CancellationToken,
    ) -> Result<Value, PipelineError>;
}

/// Main pipeline execution engine
#[derive(Clone)]
pub struct ExecutionEngine {
    executor: Arc<StepExecutor>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<dyn BrickRegistry>) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(registry)),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        Arc::make_mut(&mut self.executor).config = config;
        self
    }

    pub fn with_recorder(mut self, recorder: TraceRecorder) -> Self {
        Arc::make_mut(&mut self.executor).recorder = Some(recorder);
        self
    }

    /// Record traces to `sink` through a background recorder
    pub fn with_trace_sink(self, sink: Arc<dyn TraceSink>) -> Self {
        self.with_recorder(TraceRecorder::spawn(sink))
    }

    /// Add an event handler
    pub fn with_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.executor)
            .events
            .handlers
            .push(Arc::new(handler));
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.executor.config
    }

    pub fn registry(&self) -> &Arc<dyn BrickRegistry> {
        self.executor.registry()
    }

    /// Run a pipeline to an outcome
    pub async fn run(&self, pipeline: &Pipeline, ctx: Context, meta: RunMetadata) -> RunOutcome {
        self.run_with_cancel(pipeline, ctx, meta, CancellationToken::new())
            .await
    }

    /// Run a pipeline; cancelling `cancel` aborts the brick currently running,
    /// which fails the run like any other step error
    pub async fn run_with_cancel(
        &self,
        pipeline: &Pipeline,
        ctx: Context,
        meta: RunMetadata,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let run_id = meta.run_id;
        info!(?run_id, "Starting pipeline run ({} steps)", pipeline.len());
        self.executor.events.emit(|| ExecutionEvent::RunStarted {
            run_id,
            steps: pipeline.len(),
        });

        let outcome = RunOutcome::from_result(self.reduce(pipeline, ctx, meta, &cancel).await);
        self.finish(run_id, &outcome);
        outcome
    }

    /// Fold the steps left to right, threading the context
    ///
    /// The result is the value of the last step that ran, or `{}` when none
    /// did. Each completed step with an output key binds its value for the
    /// steps after it.
    pub async fn reduce(
        &self,
        pipeline: &Pipeline,
        ctx: Context,
        meta: RunMetadata,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineError> {
        let mut ctx = ctx;
        let mut result = Value::Object(Map::new());

        for step in pipeline.steps() {
            let outcome = self
                .executor
                .execute(step, &ctx, &meta, cancel, self.runner())
                .await?;

            if let StepOutcome::Completed { value } = outcome {
                if let Some(key) = &step.output_key {
                    ctx = ctx.with_binding(key.as_str(), value.clone());
                }
                result = value;
            }
        }

        Ok(result)
    }

    /// Complete a run that suspended at a renderer
    ///
    /// Only the renderer runs; it is traced under the original run and
    /// branches. A headless engine suspends again.
    pub async fn resume(&self, continuation: &Continuation) -> RunOutcome {
        self.resume_with_cancel(continuation, CancellationToken::new())
            .await
    }

    pub async fn resume_with_cancel(
        &self,
        continuation: &Continuation,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let run_id = continuation.run.run_id;
        info!(?run_id, "Resuming run at {}", continuation.step.display_name());
        self.executor.events.emit(|| ExecutionEvent::RunStarted { run_id, steps: 1 });

        let result = self
            .executor
            .resume(continuation, &cancel, self.runner())
            .await
            .map(|outcome| match outcome {
                StepOutcome::Completed { value } => value,
                StepOutcome::Skipped => Value::Object(Map::new()),
            });
        let outcome = RunOutcome::from_result(result);
        self.finish(run_id, &outcome);
        outcome
    }

    /// Wait until every trace record so far has reached the sink
    pub async fn flush_traces(&self) {
        if let Some(recorder) = &self.executor.recorder {
            recorder.flush().await;
        }
    }

    fn finish(&self, run_id: Option<Uuid>, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed(_) => info!(?run_id, "Pipeline run completed"),
            RunOutcome::Suspended(continuation) => info!(
                ?run_id,
                "Pipeline run suspended at renderer {}",
                continuation.step.display_name()
            ),
            RunOutcome::Cancelled(e) | RunOutcome::Superseded(e) => {
                warn!(?run_id, "Pipeline run stopped: {}", e)
            }
            RunOutcome::Failed(e) => error!(?run_id, "Pipeline run failed: {}", e),
        }
        let status = outcome.status();
        self.executor
            .events
            .emit(|| ExecutionEvent::RunFinished { run_id, status });
    }

    fn runner(&self) -> Arc<dyn PipelineRunner> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl PipelineRunner for ExecutionEngine {
    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        ctx: Context,
        meta: RunMetadata,
        cancel: CancellationToken,
    ) -> Result<Value, PipelineError> {
        self.reduce(pipeline, ctx, meta, &cancel).await
    }
}
