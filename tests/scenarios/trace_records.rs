//! Test: trace entry/exit records for every step

use crate::helpers::*;
use async_trait::async_trait;
use brick_runtime::core::{Branch, PipelineDefinition, RunMetadata, RuntimeConfig};
use brick_runtime::execution::{PipelineError, TraceEntry, TraceExit, TraceSink};
use brick_runtime::persistence::TraceStore;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A single echo step produces one entry and one exit
#[tokio::test]
async fn test_echo_is_traced() {
    let yaml = r#"
name: greet
input:
  name: Ada
pipeline:
  - id: "@core/echo"
    outputKey: greeting
    config:
      message:
        __type__: mustache
        __value__: "Hello {{ @input.name }}"
"#;

    let result = Harness::new().run_yaml(yaml).await;

    assert_completed(&result);
    assert_eq!(result.value(), &json!({"message": "Hello Ada"}));
    assert_paired_trace(&result);

    let entry = &result.entries[0];
    assert_eq!(Some(entry.run_id), result.run_id);
    assert_eq!(entry.rendered_args, Some(json!({"message": "Hello Ada"})));
    assert_eq!(entry.template_context.get("@input"), Some(&json!({"name": "Ada"})));
    assert!(entry.branches.is_empty());

    let exit = &result.exits[0];
    assert_eq!(exit.brick_instance_id, entry.brick_instance_id);
    assert_eq!(exit.output, Some(json!({"message": "Hello Ada"})));
    assert_eq!(exit.output_key.as_deref(), Some("greeting"));
    assert!(!exit.skipped_run && !exit.is_renderer && !exit.is_error());
}

/// A falsy guard skips the step, still tracing the attempted render
#[tokio::test]
async fn test_falsy_guard_skips_step() {
    let yaml = r#"
name: guarded
input:
  enabled: false
pipeline:
  - id: "@core/echo"
    config:
      message: first
  - id: "@core/echo"
    if:
      __type__: var
      __value__: "@input.enabled"
    config:
      message:
        __type__: var
        __value__: "@input.missing"
  - id: "@core/echo"
    if: "no"
    config:
      message: never
"#;

    let result = Harness::new().run_yaml(yaml).await;

    assert_completed(&result);
    assert_eq!(result.value(), &json!({"message": "first"}));
    assert_paired_trace(&result);

    assert_eq!(result.exits.len(), 3);
    assert!(!result.exits[0].skipped_run);
    assert!(result.exits[1].skipped_run);
    assert!(result.exits[2].skipped_run);
    assert_eq!(result.exits[1].output, None);

    // Missing vars are dropped from objects outside strict mode
    assert_eq!(result.entries[1].rendered_args, Some(json!({})));
    assert_eq!(result.entries[2].rendered_args, Some(json!({"message": "never"})));
}

/// A missing template placeholder fails the step with a render error
#[tokio::test]
async fn test_render_error_is_traced() {
    let yaml = r#"
name: broken
pipeline:
  - id: "@core/echo"
    config:
      message:
        __type__: mustache
        __value__: "Hello {{ @input.nobody }}"
  - id: "@core/echo"
    config:
      message: unreachable
"#;

    let result = Harness::new().run_yaml(yaml).await;

    assert!(matches!(result.outcome.error(), Some(PipelineError::Render { .. })));
    assert_paired_trace(&result);
    assert_eq!(result.entries.len(), 1);

    let render_error = result.entries[0].render_error.as_ref().unwrap();
    assert_eq!(render_error.name, "RenderError");
    assert!(render_error.message.contains("@input.nobody"));
    assert_eq!(result.entries[0].rendered_args, None);
    assert_eq!(result.exits[0].error.as_ref().unwrap().name, "RenderError");
}

/// Strict mode turns missing vars into render errors
#[tokio::test]
async fn test_strict_missing_var() {
    let yaml = r#"
name: strict
pipeline:
  - id: "@core/identity"
    config:
      value:
        __type__: var
        __value__: "@input.absent"
"#;

    let lenient = Harness::new().run_yaml(yaml).await;
    assert_eq!(lenient.value(), &json!({}));

    let strict = Harness::new()
        .with_config(RuntimeConfig::new().strict_render(true))
        .run_yaml(yaml)
        .await;
    assert!(matches!(strict.outcome.error(), Some(PipelineError::Render { .. })));
}

#[tokio::test]
async fn test_unknown_brick_is_traced() {
    let yaml = r#"
name: unknown
pipeline:
  - id: "@acme/missing"
    config:
      a: 1
"#;

    let result = Harness::new().run_yaml(yaml).await;

    assert!(matches!(
        result.outcome.error(),
        Some(PipelineError::UnknownBrick { .. })
    ));
    assert_paired_trace(&result);
    assert_eq!(result.entries[0].rendered_args, Some(json!({"a": 1})));
    assert_eq!(result.exits[0].error.as_ref().unwrap().name, "UnknownBrickError");
}

/// Nested invocations are distinguished by branch markers
#[tokio::test]
async fn test_nested_steps_carry_branches() {
    let yaml = r#"
name: loop
pipeline:
  - id: "@core/for-each"
    config:
      elements: [a, b]
      body:
        __type__: pipeline
        __value__:
          - id: "@core/echo"
            config:
              message:
                __type__: var
                __value__: "@element"
"#;

    let result = Harness::new().run_yaml(yaml).await;

    assert_completed(&result);
    assert_eq!(result.value(), &json!({"message": "b"}));
    assert_paired_trace(&result);
    assert_eq!(
        result.exit_order(),
        vec!["@core/echo", "@core/echo", "@core/for-each"]
    );

    let echoes = result.exits_for("@core/echo");
    assert_eq!(echoes[0].brick_instance_id, echoes[1].brick_instance_id);
    assert_eq!(echoes[0].branches, vec![Branch::new("body", 0)]);
    assert_eq!(echoes[1].branches, vec![Branch::new("body", 1)]);
    assert!(result.exits_for("@core/for-each")[0].branches.is_empty());
}

#[tokio::test]
async fn test_untraced_run_records_nothing() {
    let harness = Harness::new();
    let definition = PipelineDefinition::from_yaml(
        r#"
name: quiet
pipeline:
  id: "@core/echo"
  config:
    message: shh
"#,
    )
    .unwrap();

    let result = harness
        .run_definition(&definition, None, RunMetadata::untraced(), CancellationToken::new())
        .await;

    assert_completed(&result);
    assert!(harness.traces.list_runs(10).await.unwrap().is_empty());
}

struct FailingSink;

#[async_trait]
impl TraceSink for FailingSink {
    async fn add_entry(&self, _entry: TraceEntry) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    async fn add_exit(&self, _exit: TraceExit) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
}

/// Sink failures never reach the run
#[tokio::test]
async fn test_failing_sink_does_not_fail_run() {
    let harness = Harness::new();
    let engine = brick_runtime::ExecutionEngine::new(Arc::new(harness.registry.clone()))
        .with_trace_sink(Arc::new(FailingSink));
    let definition = PipelineDefinition::from_yaml(
        r#"
name: resilient
pipeline:
  id: "@core/echo"
  config:
    message: still here
"#,
    )
    .unwrap();

    let outcome = engine
        .run(&definition.pipeline, definition.context(None), RunMetadata::traced())
        .await;
    engine.flush_traces().await;

    assert_eq!(outcome.value(), Some(&json!({"message": "still here"})));
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_trace_store_records_run() {
    use brick_runtime::persistence::SqliteTraceStore;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteTraceStore::new(dir.path().join("traces.db")).await.unwrap());
    let harness = Harness::new();
    let engine = brick_runtime::ExecutionEngine::new(Arc::new(harness.registry.clone()))
        .with_trace_sink(store.clone());
    let definition = PipelineDefinition::from_yaml(
        r#"
name: persisted
pipeline:
  - id: "@core/echo"
    config:
      message: one
  - id: "@core/error"
    config:
      message: two
"#,
    )
    .unwrap();

    let meta = RunMetadata::traced();
    let run_id = meta.run_id.unwrap();
    engine
        .run(&definition.pipeline, definition.context(None), meta)
        .await;
    engine.flush_traces().await;

    let exits = store.exits_for_run(run_id).await.unwrap();
    assert_eq!(exits.len(), 2);
    assert_eq!(exits[0].output, Some(json!({"message": "one"})));
    assert_eq!(exits[1].error.as_ref().unwrap().name, "BusinessError");

    let runs = store.list_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!((runs[0].entries, runs[0].exits, runs[0].errors), (2, 2, 1));
}

/// Rerunning a pipeline of pure bricks with the same input reproduces the
/// same exit outputs in the same order
#[tokio::test]
async fn test_pure_pipeline_exits_are_deterministic() {
    let yaml = r#"
name: repeatable
input:
  names: [ada, grace]
pipeline:
  - id: "@core/for-each"
    outputKey: greetings
    config:
      elements:
        __type__: var
        __value__: "@input.names"
      body:
        __type__: pipeline
        __value__:
          - id: "@core/echo"
            config:
              message:
                __type__: nunjucks
                __value__: "hi {{ @element | upper }}"
  - id: "@core/identity"
    if: false
  - id: "@core/identity"
    config:
      last:
        __type__: var
        __value__: "@greetings.message"
"#;

    let harness = Harness::new();
    let first = harness.run_yaml(yaml).await;
    let second = harness.run_yaml(yaml).await;

    let outputs = |result: &RunResult| {
        result
            .exits
            .iter()
            .map(|exit| {
                (
                    exit.brick_id.clone(),
                    exit.branches.clone(),
                    exit.skipped_run,
                    exit.output.clone(),
                )
            })
            .collect::<Vec<_>>()
    };

    assert_completed(&first);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(outputs(&first).len(), 5);
    assert_eq!(outputs(&first), outputs(&second));
    assert_eq!(second.value(), &json!({"last": "hi GRACE"}));
}
