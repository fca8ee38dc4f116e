//! Test: renderers suspend headless runs and resume elsewhere

use crate::helpers::*;
use brick_runtime::core::{Branch, ExecutionStatus, RuntimeConfig};
use brick_runtime::execution::RunOutcome;
use serde_json::json;
use std::sync::atomic::Ordering;

const WITH_DISPLAY: &str = r#"
name: report
pipeline:
  - id: "@core/echo"
    outputKey: greeting
    config:
      message: hi
  - id: "@core/display"
    config:
      body:
        __type__: var
        __value__: "@greeting.message"
  - id: "@test/count"
"#;

fn headless() -> (Harness, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    let counting = CountingBrick::new("@test/count");
    let calls = counting.counter();
    let harness = Harness::new()
        .with_brick(counting)
        .with_config(RuntimeConfig::new().headless(true));
    (harness, calls)
}

/// A headless run stops at the renderer with everything needed to resume
#[tokio::test]
async fn test_headless_renderer_suspends() {
    let (harness, calls) = headless();

    let result = harness.run_yaml(WITH_DISPLAY).await;

    assert_eq!(result.status(), ExecutionStatus::Suspended);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_paired_trace(&result);

    let RunOutcome::Suspended(continuation) = &result.outcome else {
        panic!("expected a continuation, got {:?}", result.outcome);
    };
    assert_eq!(continuation.brick_id, "@core/display");
    assert_eq!(continuation.args, json!({"body": "hi"}));
    assert_eq!(
        continuation.context.get("@greeting"),
        Some(&json!({"message": "hi"}))
    );
    assert_eq!(continuation.run.run_id, result.run_id);

    let exit = &result.exits_for("@core/display")[0];
    assert!(exit.is_renderer);
    assert_eq!(exit.error.as_ref().unwrap().name, "ContinuationSignal");
}

/// Resuming runs only the renderer, traced under the original run
#[tokio::test]
async fn test_resume_in_display_environment() {
    let (harness, calls) = headless();
    let suspended = harness.run_yaml(WITH_DISPLAY).await;
    let RunOutcome::Suspended(continuation) = suspended.outcome else {
        panic!("expected a continuation");
    };

    let display = harness.with_config(RuntimeConfig::new());
    let engine = display.engine();
    let outcome = engine.resume(&continuation).await;
    engine.flush_traces().await;

    assert_eq!(outcome.value(), Some(&json!({"rendered": "hi"})));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let resumed = display.collect(suspended.run_id, outcome).await;
    let renders = resumed.exits_for("@core/display");
    assert_eq!(renders.len(), 2);
    assert!(renders[1].is_renderer && !renders[1].is_error());
    assert_eq!(renders[1].output, Some(json!({"rendered": "hi"})));
    assert_eq!(resumed.entries_for("@core/display")[1].rendered_args, Some(json!({"body": "hi"})));
}

#[tokio::test]
async fn test_resume_while_still_headless_suspends_again() {
    let (harness, _calls) = headless();
    let suspended = harness.run_yaml(WITH_DISPLAY).await;
    let RunOutcome::Suspended(continuation) = suspended.outcome else {
        panic!("expected a continuation");
    };

    let outcome = harness.engine().resume(&continuation).await;
    assert_eq!(outcome.status(), ExecutionStatus::Suspended);
}

/// A renderer nested in a closure suspends the whole run
#[tokio::test]
async fn test_nested_renderer_suspends_run() {
    let (harness, _calls) = headless();
    let yaml = r#"
name: nested
pipeline:
  - id: "@core/for-each"
    config:
      elements: [a]
      body:
        __type__: pipeline
        __value__:
          - id: "@core/display"
            config:
              body:
                __type__: var
                __value__: "@element"
"#;

    let result = harness.run_yaml(yaml).await;

    let RunOutcome::Suspended(continuation) = &result.outcome else {
        panic!("expected a continuation, got {:?}", result.outcome);
    };
    assert_eq!(continuation.run.branches, vec![Branch::new("body", 0)]);
    assert_eq!(continuation.args, json!({"body": "a"}));
    assert_paired_trace(&result);
}

/// Outside headless mode renderers simply run
#[tokio::test]
async fn test_renderer_runs_with_display() {
    let counting = CountingBrick::new("@test/count");
    let calls = counting.counter();
    let result = Harness::new().with_brick(counting).run_yaml(WITH_DISPLAY).await;

    assert_completed(&result);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(result.exits_for("@core/display")[0].is_renderer);
}
