//! Bricks - the units of execution a pipeline invokes
//!
//! A brick receives its rendered arguments plus a [`BrickOptions`] handle that
//! exposes the step's context, the run metadata, cancellation, logging, and a
//! way to run pipeline closures found in its arguments.

pub mod builtin;
pub mod cache;

pub use builtin::{
    DisplayBrick, EchoBrick, ErrorBrick, ForEachBrick, IdentityBrick, RetryBrick, SleepBrick,
};
pub use cache::{CacheBrick, CacheError, CacheSlot};

use crate::core::{Branch, Context, RunMetadata};
use crate::execution::{BrickError, PipelineError, PipelineRunner};
use crate::expression::{render_config, Arg, Expression, PipelineClosure, RenderOptions};
use crate::logging::LogContext;
use crate::store::StateStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A reusable unit of execution
#[async_trait]
pub trait Brick: Send + Sync {
    /// Registry identifier, e.g. `@core/echo`
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Renderers must run where output can be displayed
    fn is_renderer(&self) -> bool {
        false
    }

    async fn run(&self, args: Value, options: BrickOptions) -> Result<Value, BrickError>;
}

/// Per-invocation handle passed to a brick
#[derive(Clone)]
pub struct BrickOptions {
    /// Context the step's arguments were rendered against
    pub ctx: Context,
    /// Metadata of the invoking step
    pub meta: RunMetadata,
    /// Run-scoped cancellation signal
    pub cancel: CancellationToken,
    pub log: LogContext,
    pub render: RenderOptions,
    runner: Arc<dyn PipelineRunner>,
}

impl BrickOptions {
    pub fn new(
        ctx: Context,
        meta: RunMetadata,
        cancel: CancellationToken,
        log: LogContext,
        render: RenderOptions,
        runner: Arc<dyn PipelineRunner>,
    ) -> Self {
        Self {
            ctx,
            meta,
            cancel,
            log,
            render,
            runner,
        }
    }

    /// Run a pipeline closure with extra bindings under a new branch marker
    pub async fn run_closure(
        &self,
        closure: &PipelineClosure,
        bindings: Vec<(String, Value)>,
        branch: Branch,
    ) -> Result<Value, PipelineError> {
        let ctx = closure.context_with(bindings);
        let meta = self.meta.with_branch(branch);
        self.runner
            .run_pipeline(&closure.pipeline, ctx, meta, self.cancel.clone())
            .await
    }

    /// Render a `defer` expression from the arguments against the step's
    /// context plus `bindings`
    pub fn render_deferred(
        &self,
        value: &Value,
        bindings: Vec<(String, Value)>,
    ) -> Result<Value, BrickError> {
        let arg = Arg::from_value(value.clone())
            .map_err(|e| BrickError::InvalidArgs(e.to_string()))?;
        let arg = match arg {
            Arg::Expression(Expression::Defer(inner)) => *inner,
            other => other,
        };
        let ctx = self.ctx.with_bindings(bindings);
        render_config(&arg, &ctx, self.render).map_err(BrickError::Render)
    }
}

/// Decode a rendered pipeline argument
pub fn closure_arg(args: &Value, name: &str) -> Result<PipelineClosure, BrickError> {
    let value = args
        .get(name)
        .ok_or_else(|| BrickError::InvalidArgs(format!("missing pipeline argument '{}'", name)))?;
    PipelineClosure::from_value(value).map_err(|e| BrickError::MalformedPipeline(e.to_string()))
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("unknown brick '{0}'")]
    UnknownBrick(String),
}

/// Resolves brick ids to implementations
#[async_trait]
pub trait BrickRegistry: Send + Sync {
    async fn lookup(&self, id: &str) -> Result<Arc<dyn Brick>, RegistryError>;

    /// Registered ids, sorted
    fn ids(&self) -> Vec<String>;
}

/// Registry backed by a map, populated before use
#[derive(Clone, Default)]
pub struct InMemoryBrickRegistry {
    bricks: HashMap<String, Arc<dyn Brick>>,
}

impl InMemoryBrickRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every `@core/*` brick; the cache brick uses `store`
    pub fn with_builtins(store: Arc<dyn StateStore>) -> Self {
        Self::new()
            .with_brick(EchoBrick)
            .with_brick(IdentityBrick)
            .with_brick(ErrorBrick)
            .with_brick(SleepBrick)
            .with_brick(DisplayBrick)
            .with_brick(ForEachBrick)
            .with_brick(RetryBrick)
            .with_brick(CacheBrick::new(store))
    }

    pub fn register<B: Brick + 'static>(&mut self, brick: B) {
        self.register_arc(Arc::new(brick));
    }

    pub fn register_arc(&mut self, brick: Arc<dyn Brick>) {
        self.bricks.insert(brick.id().to_string(), brick);
    }

    pub fn with_brick<B: Brick + 'static>(mut self, brick: B) -> Self {
        self.register(brick);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Brick>> {
        self.bricks.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }
}

#[async_trait]
impl BrickRegistry for InMemoryBrickRegistry {
    async fn lookup(&self, id: &str) -> Result<Arc<dyn Brick>, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::UnknownBrick(id.to_string()))
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bricks.keys().cloned().collect();
        ids.sort();
        ids
    }
}
