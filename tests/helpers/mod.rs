//! Test utilities for brick-runtime scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use brick_runtime::bricks::{Brick, BrickOptions, InMemoryBrickRegistry};
use brick_runtime::core::{ExecutionStatus, PipelineDefinition, RunMetadata, RuntimeConfig};
use brick_runtime::execution::{
    BrickError, ExecutionEngine, ExecutionEvent, RunOutcome, TraceEntry, TraceExit,
};
use brick_runtime::persistence::{InMemoryTraceStore, TraceStore};
use brick_runtime::store::{
    InMemoryStateStore, MergeStrategy, StateChange, StateError, StateNamespace, StateStore,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Counts invocations; optionally waits before answering
pub struct CountingBrick {
    id: String,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl CountingBrick {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Brick for CountingBrick {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, args: Value, options: BrickOptions) -> Result<Value, BrickError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = options.cancel.cancelled() => return Err(BrickError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(json!({ "call": n, "args": args }))
    }
}

/// Fails with a business error until it has been called `failures` times
pub struct FlakyBrick {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyBrick {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Brick for FlakyBrick {
    fn id(&self) -> &str {
        "@test/flaky"
    }

    async fn run(&self, _args: Value, _options: BrickOptions) -> Result<Value, BrickError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(BrickError::business(format!("attempt {} failed", n)))
        } else {
            Ok(json!({ "succeededOn": n }))
        }
    }
}

/// Returns the context it was invoked with
pub struct ContextSnapshotBrick;

#[async_trait]
impl Brick for ContextSnapshotBrick {
    fn id(&self) -> &str {
        "@test/context"
    }

    async fn run(&self, _args: Value, options: BrickOptions) -> Result<Value, BrickError> {
        Ok(options.ctx.to_value())
    }
}

/// In-memory state whose reads suspend, the way a store behind I/O would
pub struct YieldingStateStore {
    inner: Arc<InMemoryStateStore>,
}

#[async_trait]
impl StateStore for YieldingStateStore {
    async fn get_state(
        &self,
        namespace: StateNamespace,
        scope_key: Option<&str>,
    ) -> Result<Value, StateError> {
        tokio::task::yield_now().await;
        let state = self.inner.get_state(namespace, scope_key).await;
        tokio::task::yield_now().await;
        state
    }

    async fn set_state(
        &self,
        namespace: StateNamespace,
        scope_key: Option<&str>,
        data: Value,
        strategy: MergeStrategy,
    ) -> Result<Value, StateError> {
        self.inner.set_state(namespace, scope_key, data, strategy).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.subscribe()
    }
}

/// Engine wired to in-memory state and trace stores
pub struct Harness {
    pub registry: InMemoryBrickRegistry,
    pub state: Arc<InMemoryStateStore>,
    pub traces: Arc<InMemoryTraceStore>,
    pub config: RuntimeConfig,
    pub events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        let state = Arc::new(InMemoryStateStore::new());
        Self {
            registry: InMemoryBrickRegistry::with_builtins(state.clone()),
            state,
            traces: Arc::new(InMemoryTraceStore::new()),
            config: RuntimeConfig::new(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Builtins read state through a [`YieldingStateStore`]; call before `with_brick`
    pub fn with_yielding_state() -> Self {
        let state = Arc::new(InMemoryStateStore::new());
        let yielding = Arc::new(YieldingStateStore {
            inner: state.clone(),
        });
        Self {
            registry: InMemoryBrickRegistry::with_builtins(yielding),
            state,
            ..Self::new()
        }
    }

    pub fn with_brick<B: Brick + 'static>(mut self, brick: B) -> Self {
        self.registry.register(brick);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(&self) -> ExecutionEngine {
        let events = self.events.clone();
        ExecutionEngine::new(Arc::new(self.registry.clone()))
            .with_config(self.config.clone())
            .with_trace_sink(self.traces.clone())
            .with_event_handler(move |event| events.lock().unwrap().push(event))
    }

    pub async fn run_yaml(&self, yaml: &str) -> RunResult {
        self.run_yaml_with_input(yaml, None).await
    }

    pub async fn run_yaml_with_input(&self, yaml: &str, input: Option<Value>) -> RunResult {
        let definition = PipelineDefinition::from_yaml(yaml).expect("valid pipeline definition");
        let mut meta = RunMetadata::traced();
        if let Some(mod_id) = &definition.mod_id {
            meta = meta.with_mod_id(mod_id);
        }
        self.run_definition(&definition, input, meta, CancellationToken::new())
            .await
    }

    pub async fn run_definition(
        &self,
        definition: &PipelineDefinition,
        input: Option<Value>,
        meta: RunMetadata,
        cancel: CancellationToken,
    ) -> RunResult {
        let engine = self.engine();
        let run_id = meta.run_id;
        let outcome = engine
            .run_with_cancel(&definition.pipeline, definition.context(input), meta, cancel)
            .await;
        engine.flush_traces().await;
        self.collect(run_id, outcome).await
    }

    pub async fn collect(&self, run_id: Option<Uuid>, outcome: RunOutcome) -> RunResult {
        let (entries, exits) = match run_id {
            Some(run_id) => (
                self.traces.entries_for_run(run_id).await.unwrap(),
                self.traces.exits_for_run(run_id).await.unwrap(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        RunResult {
            outcome,
            run_id,
            entries,
            exits,
        }
    }

    pub async fn shared_state(&self) -> Value {
        self.state
            .get_state(StateNamespace::Shared, None)
            .await
            .unwrap()
    }
}

/// Outcome of a run plus its recorded trace
#[derive(Debug)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub run_id: Option<Uuid>,
    pub entries: Vec<TraceEntry>,
    pub exits: Vec<TraceExit>,
}

impl RunResult {
    pub fn value(&self) -> &Value {
        match &self.outcome {
            RunOutcome::Completed(value) => value,
            other => panic!("expected a completed run, got {:?}", other),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.outcome.status()
    }

    /// Exits for `brick_id`, in recording order
    pub fn exits_for(&self, brick_id: &str) -> Vec<&TraceExit> {
        self.exits.iter().filter(|exit| exit.brick_id == brick_id).collect()
    }

    pub fn entries_for(&self, brick_id: &str) -> Vec<&TraceEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.brick_id == brick_id)
            .collect()
    }

    /// Brick ids in exit order
    pub fn exit_order(&self) -> Vec<&str> {
        self.exits.iter().map(|exit| exit.brick_id.as_str()).collect()
    }
}

/// Every traced step has exactly one entry and one exit
pub fn assert_paired_trace(result: &RunResult) {
    assert_eq!(
        result.entries.len(),
        result.exits.len(),
        "entries and exits differ: {:?} vs {:?}",
        result.entries.iter().map(|e| &e.brick_id).collect::<Vec<_>>(),
        result.exit_order()
    );
    for entry in &result.entries {
        let matching = result
            .exits
            .iter()
            .filter(|exit| {
                exit.brick_instance_id == entry.brick_instance_id && exit.branches == entry.branches
            })
            .count();
        assert_eq!(matching, 1, "entry for {} has {} exits", entry.brick_id, matching);
    }
}

pub fn assert_completed(result: &RunResult) {
    assert_eq!(
        result.status(),
        ExecutionStatus::Completed,
        "run did not complete: {:?}",
        result.outcome
    );
}
