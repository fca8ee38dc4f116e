//! Test: the cache brick coalesces concurrent requests per key

use crate::helpers::*;
use brick_runtime::core::ExecutionStatus;
use brick_runtime::store::{MergeStrategy, StateNamespace, StateStore};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

fn cached(extra: &str) -> String {
    format!(
        r#"
name: cached
pipeline:
  - id: "@core/cache"
    config:
      key: answer
{extra}
      body:
        __type__: pipeline
        __value__:
          - id: "@test/slow"
"#
    )
}

/// Slot of an attempt that is still running
fn fetching_slot(request_id: Uuid) -> serde_json::Value {
    json!({
        "requestId": request_id,
        "isUninitialized": false,
        "isLoading": true,
        "isFetching": true,
        "isSuccess": false,
        "isError": false,
        "currentData": null,
        "data": null,
        "error": null,
        "expiresAt": null,
    })
}

fn slow_harness() -> (Harness, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    let slow = CountingBrick::new("@test/slow").with_delay(Duration::from_millis(50));
    let calls = slow.counter();
    (Harness::new().with_brick(slow), calls)
}

/// Two overlapping callers share one body execution and one value
#[tokio::test]
async fn test_concurrent_callers_share_one_execution() {
    let (harness, calls) = slow_harness();
    let yaml = cached("");

    let (first, second) = tokio::join!(harness.run_yaml(&yaml), harness.run_yaml(&yaml));

    assert_completed(&first);
    assert_completed(&second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.value(), second.value());
    assert_eq!(first.value()["call"], json!(1));

    // Only one of the runs traced a body execution
    let bodies = first.exits_for("@test/slow").len() + second.exits_for("@test/slow").len();
    assert_eq!(bodies, 1);

    let slot = &harness.shared_state().await["answer"];
    assert_eq!(slot["isSuccess"], json!(true));
    assert_eq!(slot["isFetching"], json!(false));
    assert_eq!(slot["data"], first.value().clone());
    assert_eq!(slot["expiresAt"], json!(null));
}

/// Callers whose reads suspend still converge on a single body execution
#[tokio::test]
async fn test_concurrent_callers_with_suspending_store() {
    let slow = CountingBrick::new("@test/slow").with_delay(Duration::from_millis(50));
    let calls = slow.counter();
    let harness = Harness::with_yielding_state().with_brick(slow);
    let yaml = cached("");

    let (first, second) = tokio::join!(harness.run_yaml(&yaml), harness.run_yaml(&yaml));

    assert_completed(&first);
    assert_completed(&second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.value(), second.value());
    assert_eq!(harness.shared_state().await["answer"]["isSuccess"], json!(true));
}

/// Without a ttl a settled value is reused indefinitely
#[tokio::test]
async fn test_settled_value_is_reused() {
    let (harness, calls) = slow_harness();
    let yaml = cached("");

    let first = harness.run_yaml(&yaml).await;
    let second = harness.run_yaml(&yaml).await;

    assert_eq!(first.value(), second.value());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A zero ttl expires immediately, so the next caller recomputes
#[tokio::test]
async fn test_expired_value_is_recomputed() {
    let (harness, calls) = slow_harness();
    let yaml = cached("      ttl: 0");

    harness.run_yaml(&yaml).await;
    let second = harness.run_yaml(&yaml).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(second.value()["call"], json!(2));
}

#[tokio::test]
async fn test_force_fetch_bypasses_fresh_value() {
    let (harness, calls) = slow_harness();

    harness.run_yaml(&cached("")).await;
    harness.run_yaml(&cached("      forceFetch: true")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Failures are recorded in the slot but not served as fresh values
#[tokio::test]
async fn test_failure_is_not_cached_as_fresh() {
    let flaky = FlakyBrick::new(1);
    let calls = flaky.counter();
    let harness = Harness::new().with_brick(flaky);
    let yaml = r#"
name: cached
pipeline:
  - id: "@core/cache"
    config:
      key: flaky
      body:
        __type__: pipeline
        __value__:
          - id: "@test/flaky"
"#;

    let first = harness.run_yaml(yaml).await;
    assert_eq!(first.status(), ExecutionStatus::Failed);
    let slot = &harness.shared_state().await["flaky"];
    assert_eq!(slot["isError"], json!(true));
    assert_eq!(slot["error"]["message"], json!("attempt 1 failed"));

    let second = harness.run_yaml(yaml).await;
    assert_eq!(second.value(), &json!({"succeededOn": 2}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// A caller whose request was replaced mid-flight does not write its result
#[tokio::test]
async fn test_superseded_request_is_discarded() {
    let (harness, calls) = slow_harness();
    let yaml = cached("");
    let replacement = Uuid::new_v4();

    let replace = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        harness
            .state
            .set_state(
                StateNamespace::Shared,
                None,
                json!({ "answer": fetching_slot(replacement) }),
                MergeStrategy::Shallow,
            )
            .await
            .unwrap();
    };

    let (result, _) = tokio::join!(harness.run_yaml(&yaml), replace);

    assert_eq!(result.status(), ExecutionStatus::Superseded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let slot = &harness.shared_state().await["answer"];
    assert_eq!(slot["requestId"], json!(replacement));
    assert_eq!(slot["isFetching"], json!(true));
}

/// Runs of a mod cache into that mod's namespace
#[tokio::test]
async fn test_mod_runs_use_mod_namespace() {
    let (harness, _calls) = slow_harness();
    let yaml = cached("").replace("name: cached", "name: cached\nmodId: acme");

    let result = harness.run_yaml(&yaml).await;
    assert_completed(&result);

    assert_eq!(harness.shared_state().await, json!({}));
    let scoped = harness
        .state
        .get_state(StateNamespace::Mod, Some("acme"))
        .await
        .unwrap();
    assert_eq!(scoped["answer"]["isSuccess"], json!(true));
}

/// A waiting caller gives up once another attempt takes over the slot
#[tokio::test]
async fn test_waiter_superseded_by_new_attempt() {
    let (harness, calls) = slow_harness();
    let yaml = cached("");
    let replacement = Uuid::new_v4();

    let waiter = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        harness.run_yaml(&yaml).await
    };
    let replace = async {
        tokio::time::sleep(Duration::from_millis(15)).await;
        harness
            .state
            .set_state(
                StateNamespace::Shared,
                None,
                json!({ "answer": fetching_slot(replacement) }),
                MergeStrategy::Shallow,
            )
            .await
            .unwrap();
    };

    let (first, waited, _) = tokio::join!(harness.run_yaml(&yaml), waiter, replace);

    assert_eq!(waited.status(), ExecutionStatus::Superseded);
    assert!(waited.exits_for("@test/slow").is_empty());
    assert_eq!(first.status(), ExecutionStatus::Superseded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A waiting caller does not hang when the slot is cleared under it
#[tokio::test]
async fn test_waiter_released_when_slot_cleared() {
    let (harness, _calls) = slow_harness();
    let yaml = cached("");

    let waiter = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::time::timeout(Duration::from_secs(2), harness.run_yaml(&yaml)).await
    };
    let clear = async {
        tokio::time::sleep(Duration::from_millis(15)).await;
        harness
            .state
            .set_state(StateNamespace::Shared, None, json!({}), MergeStrategy::Replace)
            .await
            .unwrap();
    };

    let (first, waited, _) = tokio::join!(harness.run_yaml(&yaml), waiter, clear);

    let waited = waited.expect("waiter should settle after the slot is cleared");
    assert_eq!(waited.status(), ExecutionStatus::Superseded);
    assert_eq!(first.status(), ExecutionStatus::Superseded);
}

/// A malformed slot fails the run without touching the stored state
#[tokio::test]
async fn test_corrupted_slot_fails_run() {
    let (harness, calls) = slow_harness();
    let corrupted = json!({ "answer": { "isFetching": "yes" } });
    harness
        .state
        .set_state(StateNamespace::Shared, None, corrupted.clone(), MergeStrategy::Replace)
        .await
        .unwrap();

    let result = harness.run_yaml(&cached("")).await;

    assert_eq!(result.status(), ExecutionStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let error = result.exits_for("@core/cache")[0].error.clone().unwrap();
    assert_eq!(error.name, "BusinessError");
    assert!(error.message.starts_with("cache corrupted for key 'answer'"));
    assert_eq!(error.details, Some(json!({"key": "answer"})));
    assert_eq!(harness.shared_state().await, corrupted);
}
