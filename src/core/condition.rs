//! Conditional guards

use crate::core::Context;
use crate::expression::{render_arg, Arg, RenderErrors, RenderOptions};
use serde_json::Value;

const TRUE_FLAGS: [&str; 6] = ["true", "t", "yes", "y", "on", "1"];

/// Boolean reading of a rendered guard value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => {
            let flag = s.trim().to_lowercase();
            TRUE_FLAGS.contains(&flag.as_str())
        }
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a step's guard and read it as a boolean
///
/// A missing value is falsy. Render failures are returned so the caller can
/// record them.
pub fn evaluate_guard(
    condition: &Arg,
    ctx: &Context,
    options: RenderOptions,
) -> Result<bool, RenderErrors> {
    let rendered = render_arg(condition, ctx, options)?;
    Ok(rendered.as_ref().is_some_and(is_truthy))
}
