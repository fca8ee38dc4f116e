//! Builtin `@core/*` bricks

use crate::bricks::{closure_arg, Brick, BrickOptions};
use crate::core::Branch;
use crate::execution::BrickError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, BrickError> {
    serde_json::from_value(args).map_err(|e| BrickError::InvalidArgs(e.to_string()))
}

/// Cancellable sleep; `Err(Cancelled)` if the run is cancelled first
async fn sleep_or_cancel(duration: Duration, options: &BrickOptions) -> Result<(), BrickError> {
    tokio::select! {
        _ = options.cancel.cancelled() => Err(BrickError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Returns `{message}`
pub struct EchoBrick;

#[derive(Deserialize)]
struct EchoArgs {
    #[serde(default)]
    message: Value,
}

#[async_trait]
impl Brick for EchoBrick {
    fn id(&self) -> &str {
        "@core/echo"
    }

    fn description(&self) -> &str {
        "Return the message argument"
    }

    async fn run(&self, args: Value, _options: BrickOptions) -> Result<Value, BrickError> {
        let args: EchoArgs = parse_args(args)?;
        Ok(json!({ "message": args.message }))
    }
}

/// Returns its arguments unchanged
pub struct IdentityBrick;

#[async_trait]
impl Brick for IdentityBrick {
    fn id(&self) -> &str {
        "@core/identity"
    }

    fn description(&self) -> &str {
        "Return the arguments unchanged"
    }

    async fn run(&self, args: Value, _options: BrickOptions) -> Result<Value, BrickError> {
        Ok(args)
    }
}

/// Fails with a business error
pub struct ErrorBrick;

#[derive(Deserialize)]
struct ErrorArgs {
    #[serde(default = "default_error_message")]
    message: String,
    #[serde(default)]
    details: Option<Value>,
}

fn default_error_message() -> String {
    "Error".to_string()
}

#[async_trait]
impl Brick for ErrorBrick {
    fn id(&self) -> &str {
        "@core/error"
    }

    fn description(&self) -> &str {
        "Raise a business error"
    }

    async fn run(&self, args: Value, _options: BrickOptions) -> Result<Value, BrickError> {
        let args: ErrorArgs = parse_args(args)?;
        Err(BrickError::Business {
            message: args.message,
            details: args.details,
        })
    }
}

/// Waits, observing cancellation
pub struct SleepBrick;

#[derive(Deserialize)]
struct SleepArgs {
    millis: u64,
}

#[async_trait]
impl Brick for SleepBrick {
    fn id(&self) -> &str {
        "@core/sleep"
    }

    fn description(&self) -> &str {
        "Wait for a number of milliseconds"
    }

    async fn run(&self, args: Value, options: BrickOptions) -> Result<Value, BrickError> {
        let args: SleepArgs = parse_args(args)?;
        options.log.debug(&format!("Sleeping {}ms", args.millis));
        sleep_or_cancel(Duration::from_millis(args.millis), &options).await?;
        Ok(json!({}))
    }
}

/// Renderer: displays its `body`
pub struct DisplayBrick;

#[async_trait]
impl Brick for DisplayBrick {
    fn id(&self) -> &str {
        "@core/display"
    }

    fn description(&self) -> &str {
        "Display the body argument"
    }

    fn is_renderer(&self) -> bool {
        true
    }

    async fn run(&self, args: Value, options: BrickOptions) -> Result<Value, BrickError> {
        let body = args.get("body").cloned().unwrap_or(Value::Null);
        let text = match &body {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        options.log.info(&text);
        Ok(json!({ "rendered": body }))
    }
}

/// Runs `body` once per element with the element bound to `@<elementKey>`
pub struct ForEachBrick;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForEachArgs {
    elements: Vec<Value>,
    #[serde(default = "default_element_key")]
    element_key: String,
}

fn default_element_key() -> String {
    "element".to_string()
}

#[async_trait]
impl Brick for ForEachBrick {
    fn id(&self) -> &str {
        "@core/for-each"
    }

    fn description(&self) -> &str {
        "Run the body pipeline for each element; returns the last result"
    }

    async fn run(&self, args: Value, options: BrickOptions) -> Result<Value, BrickError> {
        let body = closure_arg(&args, "body")?;
        let args: ForEachArgs = parse_args(args)?;

        let mut last = json!({});
        for (index, element) in args.elements.into_iter().enumerate() {
            last = options
                .run_closure(
                    &body,
                    vec![(args.element_key.clone(), element)],
                    Branch::new("body", index),
                )
                .await?;
        }
        Ok(last)
    }
}

/// Re-runs `body` after business failures
pub struct RetryBrick;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryArgs {
    #[serde(default = "default_max_retries")]
    max_retries: usize,
    #[serde(default)]
    interval_millis: u64,
}

fn default_max_retries() -> usize {
    3
}

#[async_trait]
impl Brick for RetryBrick {
    fn id(&self) -> &str {
        "@core/retry"
    }

    fn description(&self) -> &str {
        "Run the body pipeline, retrying business errors"
    }

    async fn run(&self, args: Value, options: BrickOptions) -> Result<Value, BrickError> {
        let body = closure_arg(&args, "body")?;
        let args: RetryArgs = parse_args(args)?;

        let mut attempt = 0;
        loop {
            match options
                .run_closure(&body, Vec::new(), Branch::new("body", attempt))
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_business_failure() && attempt < args.max_retries => {
                    options.log.warn(&format!("Attempt {} failed: {}", attempt + 1, e));
                    attempt += 1;
                    sleep_or_cancel(Duration::from_millis(args.interval_millis), &options).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
