//! Test: context threading between steps and into pipeline closures

use crate::helpers::*;
use serde_json::json;

/// Output keys bind values for later steps only
#[tokio::test]
async fn test_output_key_threads_forward() {
    let yaml = r#"
name: threading
pipeline:
  - id: "@core/echo"
    outputKey: first
    config:
      message: a
  - id: "@core/echo"
    config:
      message: b
  - id: "@core/identity"
    config:
      fromFirst:
        __type__: var
        __value__: "@first.message"
      fromSecond:
        __type__: var
        __value__: "@second.message"
"#;

    let result = Harness::new().run_yaml(yaml).await;

    assert_completed(&result);
    assert_eq!(result.value(), &json!({"fromFirst": "a"}));
}

/// The context a brick sees holds only the base bindings and prior outputs
#[tokio::test]
async fn test_context_visible_to_brick() {
    let yaml = r#"
name: snapshot
input:
  n: 1
options:
  verbose: true
pipeline:
  - id: "@core/echo"
    outputKey: greeting
    config:
      message: hi
  - id: "@test/context"
"#;

    let result = Harness::new()
        .with_brick(ContextSnapshotBrick)
        .run_yaml(yaml)
        .await;

    assert_eq!(
        result.value(),
        &json!({
            "@input": {"n": 1},
            "@options": {"verbose": true},
            "@greeting": {"message": "hi"},
        })
    );
}

/// `--input` style overrides replace the definition's input
#[tokio::test]
async fn test_input_override() {
    let yaml = r#"
name: override
input:
  name: default
pipeline:
  id: "@core/echo"
  config:
    message:
      __type__: nunjucks
      __value__: "{{ @input.name | upper }}"
"#;

    let harness = Harness::new();
    assert_eq!(
        harness.run_yaml(yaml).await.value(),
        &json!({"message": "DEFAULT"})
    );
    assert_eq!(
        harness
            .run_yaml_with_input(yaml, Some(json!({"name": "ada"})))
            .await
            .value(),
        &json!({"message": "ADA"})
    );
}

/// Missing vars become null inside arrays
#[tokio::test]
async fn test_missing_var_in_array_is_null() {
    let yaml = r#"
name: arrays
pipeline:
  - id: "@core/identity"
    config:
      list:
        - __type__: var
          __value__: "@input.nope"
        - 1
      present:
        __type__: var
        __value__: "@input?.nope?.deeper"
"#;

    let result = Harness::new().run_yaml(yaml).await;
    assert_eq!(result.value(), &json!({"list": [null, 1]}));
}

/// A closure sees the context where it was rendered plus the invoker's
/// bindings, and its own outputs never leak back out
#[tokio::test]
async fn test_closure_captures_render_context() {
    let yaml = r#"
name: closures
pipeline:
  - id: "@core/echo"
    outputKey: outer
    config:
      message: captured
  - id: "@core/echo"
    outputKey: element
    config:
      message: shadowed
  - id: "@core/for-each"
    outputKey: loop
    config:
      elements: [x]
      body:
        __type__: pipeline
        __value__:
          - id: "@core/echo"
            outputKey: inner
            config:
              message: inside
          - id: "@test/context"
  - id: "@core/identity"
    config:
      leaked:
        __type__: var
        __value__: "@inner"
      looped:
        __type__: var
        __value__: '@loop["@element"]'
"#;

    let result = Harness::new()
        .with_brick(ContextSnapshotBrick)
        .run_yaml(yaml)
        .await;
    assert_completed(&result);

    let snapshot = &result.exits_for("@test/context")[0];
    let seen = snapshot.output.as_ref().unwrap();
    assert_eq!(seen["@outer"], json!({"message": "captured"}));
    assert_eq!(seen["@element"], json!("x"));
    assert_eq!(seen["@inner"], json!({"message": "inside"}));

    assert_eq!(result.value(), &json!({"looped": "x"}));
}

/// v1 definitions are upgraded: bare placeholders resolve under `@input`
#[tokio::test]
async fn test_legacy_v1_definition_runs() {
    let yaml = r#"
apiVersion: v1
name: ancient
input:
  name: Ada
pipeline:
  - id: "@core/echo"
    config:
      message: "Hi {{ name }}"
"#;

    let result = Harness::new().run_yaml(yaml).await;
    assert_eq!(result.value(), &json!({"message": "Hi Ada"}));
}
