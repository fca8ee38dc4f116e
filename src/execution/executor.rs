//! Step executor - runs one step: guard, render, resolve, invoke

use crate::{
    bricks::{BrickOptions, BrickRegistry},
    core::{
        evaluate_guard, BrickConfig, Context, RunMetadata, RuntimeConfig, StepOutcome, StepPhase,
    },
    execution::{
        engine::{EventBus, ExecutionEvent},
        error::{ErrorContext, ErrorKind, PipelineError, SerializedError},
        handoff::Continuation,
        trace::{TraceEntry, TraceExit, TraceRecorder},
        PipelineRunner,
    },
    expression::render_config,
    logging::LogContext,
};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Executes single steps against a brick registry
#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<dyn BrickRegistry>,
    pub(crate) config: RuntimeConfig,
    pub(crate) recorder: Option<TraceRecorder>,
    pub(crate) events: EventBus,
}

impl StepExecutor {
    pub fn new(registry: Arc<dyn BrickRegistry>) -> Self {
        Self {
            registry,
            config: RuntimeConfig::default(),
            recorder: None,
            events: EventBus::default(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn BrickRegistry> {
        &self.registry
    }

    /// Execute a step
    ///
    /// Every executed step reports exactly one trace entry and one trace
    /// exit when the run is traced, whether it completes, fails, suspends or
    /// is skipped.
    pub async fn execute(
        &self,
        step: &BrickConfig,
        ctx: &Context,
        meta: &RunMetadata,
        cancel: &CancellationToken,
        runner: Arc<dyn PipelineRunner>,
    ) -> Result<StepOutcome, PipelineError> {
        let span = info_span!(
            "brick",
            brick_id = %step.id,
            instance_id = %step.instance_id,
            run_id = ?meta.run_id,
            label = step.label.as_deref().unwrap_or(""),
        );
        self.execute_step(step, ctx, meta, cancel, runner)
            .instrument(span)
            .await
    }

    async fn execute_step(
        &self,
        step: &BrickConfig,
        ctx: &Context,
        meta: &RunMetadata,
        cancel: &CancellationToken,
        runner: Arc<dyn PipelineRunner>,
    ) -> Result<StepOutcome, PipelineError> {
        let render = self.config.render_options();
        debug!(phase = ?StepPhase::Pending, "Executing step {}", step.display_name());
        self.events.emit(|| ExecutionEvent::StepStarted {
            instance_id: step.instance_id,
            brick_id: step.id.clone(),
            label: step.label.clone(),
            depth: meta.branches.len(),
        });

        if let Some(condition) = &step.condition {
            debug!(phase = ?StepPhase::GuardEvaluating, "Evaluating guard");
            match evaluate_guard(condition, ctx, render) {
                Ok(true) => {}
                Ok(false) => return Ok(self.skip(step, ctx, meta)),
                Err(errors) => {
                    let serialized = SerializedError::from_render(&errors);
                    self.trace_entry(step, ctx, meta, |entry| entry.render_error = Some(serialized));
                    let error = PipelineError::Render {
                        context: ErrorContext::new(step, meta),
                        errors,
                    };
                    return Err(self.fail(step, meta, error, false));
                }
            }
        }

        debug!(phase = ?StepPhase::ArgsRendering, "Rendering arguments");
        let args = match render_config(&step.config, ctx, render) {
            Ok(args) => args,
            Err(errors) => {
                let serialized = SerializedError::from_render(&errors);
                self.trace_entry(step, ctx, meta, |entry| entry.render_error = Some(serialized));
                let error = PipelineError::Render {
                    context: ErrorContext::new(step, meta),
                    errors,
                };
                return Err(self.fail(step, meta, error, false));
            }
        };
        self.trace_entry(step, ctx, meta, |entry| entry.rendered_args = Some(args.clone()));

        let log = LogContext::for_run(meta).child_for(step, meta);
        self.invoke(step, ctx, meta, args, log, cancel, runner).await
    }

    /// Re-dispatch a suspended renderer with its captured arguments
    pub async fn resume(
        &self,
        continuation: &Continuation,
        cancel: &CancellationToken,
        runner: Arc<dyn PipelineRunner>,
    ) -> Result<StepOutcome, PipelineError> {
        let step = &continuation.step;
        let meta = &continuation.run;
        let ctx = &continuation.context;
        let span = info_span!(
            "brick",
            brick_id = %step.id,
            instance_id = %step.instance_id,
            run_id = ?meta.run_id,
            label = step.label.as_deref().unwrap_or(""),
        );

        async move {
            info!("Resuming {}", step.display_name());
            self.events.emit(|| ExecutionEvent::StepStarted {
                instance_id: step.instance_id,
                brick_id: step.id.clone(),
                label: step.label.clone(),
                depth: meta.branches.len(),
            });
            self.trace_entry(step, ctx, meta, |entry| {
                entry.rendered_args = Some(continuation.args.clone())
            });
            self.invoke(
                step,
                ctx,
                meta,
                continuation.args.clone(),
                continuation.log_context.clone(),
                cancel,
                runner,
            )
            .await
        }
        .instrument(span)
        .await
    }

    /// Resolve and run the brick; the trace entry has already been recorded
    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        step: &BrickConfig,
        ctx: &Context,
        meta: &RunMetadata,
        args: Value,
        log: LogContext,
        cancel: &CancellationToken,
        runner: Arc<dyn PipelineRunner>,
    ) -> Result<StepOutcome, PipelineError> {
        let brick = match self.registry.lookup(&step.id).await {
            Ok(brick) => brick,
            Err(e) => {
                warn!("{}", e);
                let error = PipelineError::UnknownBrick {
                    context: ErrorContext::new(step, meta),
                };
                return Err(self.fail(step, meta, error, false));
            }
        };
        let is_renderer = brick.is_renderer();

        if is_renderer && self.config.headless {
            info!("Renderer cannot run headless; handing off");
            let continuation = Continuation::new(step, args, ctx, meta, log);
            let error = PipelineError::Suspended(Box::new(continuation));
            return Err(self.fail(step, meta, error, true));
        }

        debug!(phase = ?StepPhase::Invoking, "Invoking brick");
        let render = self.config.render_options();
        let options = BrickOptions::new(ctx.clone(), meta.clone(), cancel.clone(), log, render, runner);

        match brick.run(args, options).await {
            Ok(value) => {
                debug!(phase = ?StepPhase::Settled, "Step completed");
                self.trace_exit(step, meta, |exit| {
                    exit.is_renderer = is_renderer;
                    exit.output = Some(value.clone());
                });
                self.events.emit(|| ExecutionEvent::StepCompleted {
                    instance_id: step.instance_id,
                    brick_id: step.id.clone(),
                    output: value.clone(),
                    depth: meta.branches.len(),
                });
                Ok(StepOutcome::Completed { value })
            }
            Err(e) => {
                let error = PipelineError::from_brick(e, ErrorContext::new(step, meta));
                Err(self.fail(step, meta, error, is_renderer))
            }
        }
    }

    /// Guard was falsy: record the attempted render and a skipped exit
    fn skip(&self, step: &BrickConfig, ctx: &Context, meta: &RunMetadata) -> StepOutcome {
        info!("Skipping {}: guard is falsy", step.display_name());
        if self.is_tracing(meta) {
            let rendered = render_config(&step.config, ctx, self.config.render_options());
            self.trace_entry(step, ctx, meta, |entry| match rendered {
                Ok(args) => entry.rendered_args = Some(args),
                Err(errors) => entry.render_error = Some(SerializedError::from_render(&errors)),
            });
            self.trace_exit(step, meta, |exit| exit.skipped_run = true);
        }
        self.events.emit(|| ExecutionEvent::StepSkipped {
            instance_id: step.instance_id,
            brick_id: step.id.clone(),
            depth: meta.branches.len(),
        });
        StepOutcome::Skipped
    }

    /// Record the failure exit and return the error for propagation
    fn fail(
        &self,
        step: &BrickConfig,
        meta: &RunMetadata,
        error: PipelineError,
        is_renderer: bool,
    ) -> PipelineError {
        match error.kind() {
            ErrorKind::Continuation => debug!("Step suspended"),
            ErrorKind::Cancelled | ErrorKind::Superseded => info!("Step stopped: {}", error),
            _ => warn!("Step failed: {}", error),
        }
        self.trace_exit(step, meta, |exit| {
            exit.is_renderer = is_renderer;
            exit.error = Some(error.serialize());
        });
        self.events.emit(|| ExecutionEvent::StepFailed {
            instance_id: step.instance_id,
            brick_id: step.id.clone(),
            error: error.to_string(),
            kind: error.kind(),
            depth: meta.branches.len(),
        });
        error
    }

    fn is_tracing(&self, meta: &RunMetadata) -> bool {
        self.recorder.is_some() && meta.tracing_enabled()
    }

    fn trace_entry(
        &self,
        step: &BrickConfig,
        ctx: &Context,
        meta: &RunMetadata,
        fill: impl FnOnce(&mut TraceEntry),
    ) {
        if let (Some(recorder), Some(run_id)) = (&self.recorder, meta.run_id) {
            let mut entry = TraceEntry::new(run_id, step, meta, ctx);
            fill(&mut entry);
            recorder.add_entry(entry);
        }
    }

    fn trace_exit(&self, step: &BrickConfig, meta: &RunMetadata, fill: impl FnOnce(&mut TraceExit)) {
        if let (Some(recorder), Some(run_id)) = (&self.recorder, meta.run_id) {
            let mut exit = TraceExit::new(run_id, step, meta);
            fill(&mut exit);
            recorder.add_exit(exit);
        }
    }
}
