//! Pipeline closures - sub-pipelines bound to the context they were rendered in

use crate::core::{Context, Pipeline};
use crate::expression::{ExpressionError, ENV_KEY, TYPE_KEY, VALUE_KEY};
use serde_json::{Map, Value};

/// A rendered `pipeline` expression
///
/// The captured context is a snapshot taken when the expression was rendered;
/// the expression node in the configuration is never touched, so rendering the
/// same literal under different contexts yields independent closures.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineClosure {
    pub pipeline: Pipeline,
    pub captured: Context,
}

impl PipelineClosure {
    pub fn capture(pipeline: &Pipeline, ctx: &Context) -> Self {
        Self {
            pipeline: pipeline.clone(),
            captured: ctx.clone(),
        }
    }

    /// Context for one invocation: the captured context overlaid with the
    /// invoker's bindings. Invoker bindings win on collision.
    pub fn context_with<I>(&self, bindings: I) -> Context
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.captured.with_bindings(bindings)
    }

    /// Whether `value` looks like a rendered closure
    pub fn is_closure(value: &Value) -> bool {
        value
            .get(TYPE_KEY)
            .and_then(Value::as_str)
            .is_some_and(|kind| kind == "pipeline")
            && value.get(ENV_KEY).is_some()
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(TYPE_KEY.to_string(), Value::String("pipeline".to_string()));
        map.insert(VALUE_KEY.to_string(), self.pipeline.to_value());
        map.insert(ENV_KEY.to_string(), self.captured.to_value());
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ExpressionError> {
        let invalid = |message: &str| ExpressionError::InvalidValue {
            kind: "pipeline".to_string(),
            message: message.to_string(),
        };

        if value.get(TYPE_KEY).and_then(Value::as_str) != Some("pipeline") {
            return Err(invalid("expected a rendered pipeline expression"));
        }
        let steps = value
            .get(VALUE_KEY)
            .cloned()
            .ok_or_else(|| invalid("missing __value__"))?;
        let env = value
            .get(ENV_KEY)
            .cloned()
            .ok_or_else(|| invalid("missing captured context"))?;

        let pipeline: Pipeline =
            serde_json::from_value(steps).map_err(|e| invalid(&e.to_string()))?;
        let captured: Context =
            serde_json::from_value(env).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self { pipeline, captured })
    }
}
