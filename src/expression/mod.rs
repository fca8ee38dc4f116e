//! Expression language
//!
//! Brick configuration values are argument trees whose leaves may be
//! expressions. On the wire an expression is an object of the form
//! `{"__type__": "<kind>", "__value__": <payload>}`; everything else is a
//! literal (recursively, for objects and arrays).

pub mod closure;
pub mod path;
pub mod render;
pub mod template;

pub use closure::PipelineClosure;
pub use path::{Lookup, VarPath};
pub use render::{
    render_arg, render_config, render_expression, RenderError, RenderErrorKind, RenderErrors,
    RenderOptions, Rendered,
};
pub use template::Template;

use crate::core::Pipeline;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const TYPE_KEY: &str = "__type__";
pub const VALUE_KEY: &str = "__value__";
pub const ENV_KEY: &str = "__env__";

/// Errors decoding or parsing an expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unknown expression type '{0}'")]
    UnknownType(String),

    #[error("invalid {kind} expression: {message}")]
    InvalidValue { kind: String, message: String },

    #[error("invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),
}

impl ExpressionError {
    fn invalid(kind: &str, message: impl Into<String>) -> Self {
        ExpressionError::InvalidValue {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// Template dialects understood by the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateEngine {
    Mustache,
    Nunjucks,
}

impl TemplateEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateEngine::Mustache => "mustache",
            TemplateEngine::Nunjucks => "nunjucks",
        }
    }
}

/// A non-literal argument leaf
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Context-path lookup, e.g. `@input.items[0].name`
    Var(String),

    /// String interpolation in one of the template dialects
    Template {
        engine: TemplateEngine,
        template: String,
    },

    /// Embedded sub-pipeline; rendering captures the current context
    Pipeline(Pipeline),

    /// Left unrendered for the receiving brick to render later
    Defer(Box<Arg>),
}

impl Expression {
    pub fn kind(&self) -> &'static str {
        match self {
            Expression::Var(_) => "var",
            Expression::Template { engine, .. } => engine.as_str(),
            Expression::Pipeline(_) => "pipeline",
            Expression::Defer(_) => "defer",
        }
    }

    fn from_wire(mut map: Map<String, Value>) -> Result<Self, ExpressionError> {
        let kind = match map.remove(TYPE_KEY) {
            Some(Value::String(kind)) => kind,
            Some(other) => return Err(ExpressionError::UnknownType(other.to_string())),
            None => return Err(ExpressionError::UnknownType(String::new())),
        };
        let value = map
            .remove(VALUE_KEY)
            .ok_or_else(|| ExpressionError::invalid(&kind, "missing __value__"))?;
        if let Some(extra) = map.keys().next() {
            return Err(ExpressionError::invalid(
                &kind,
                format!("unexpected key '{}'", extra),
            ));
        }

        match kind.as_str() {
            "var" => match value {
                Value::String(path) => Ok(Expression::Var(path)),
                other => Err(ExpressionError::invalid(
                    "var",
                    format!("expected a string path, got {}", other),
                )),
            },
            "mustache" | "nunjucks" => {
                let engine = if kind == "mustache" {
                    TemplateEngine::Mustache
                } else {
                    TemplateEngine::Nunjucks
                };
                match value {
                    Value::String(template) => Ok(Expression::Template { engine, template }),
                    other => Err(ExpressionError::invalid(
                        &kind,
                        format!("expected a template string, got {}", other),
                    )),
                }
            }
            "pipeline" => serde_json::from_value::<Pipeline>(value)
                .map(Expression::Pipeline)
                .map_err(|e| ExpressionError::invalid("pipeline", e.to_string())),
            "defer" => Arg::from_value(value).map(|arg| Expression::Defer(Box::new(arg))),
            _ => Err(ExpressionError::UnknownType(kind)),
        }
    }

    /// Wire representation of the expression
    pub fn to_wire(&self) -> Value {
        let payload = match self {
            Expression::Var(path) => Value::String(path.clone()),
            Expression::Template { template, .. } => Value::String(template.clone()),
            Expression::Pipeline(pipeline) => pipeline.to_value(),
            Expression::Defer(arg) => arg.to_value(),
        };
        let mut map = Map::new();
        map.insert(TYPE_KEY.to_string(), Value::String(self.kind().to_string()));
        map.insert(VALUE_KEY.to_string(), payload);
        Value::Object(map)
    }
}

/// A configuration value: literals, containers, and expression leaves
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    Array(Vec<Arg>),
    Object(BTreeMap<String, Arg>),
    Expression(Expression),
}

impl Arg {
    /// Decode a wire value into an argument tree
    pub fn from_value(value: Value) -> Result<Self, ExpressionError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(Arg::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Arg::Array),
            Value::Object(map) => {
                if map.contains_key(TYPE_KEY) {
                    return Expression::from_wire(map).map(Arg::Expression);
                }
                map.into_iter()
                    .map(|(key, value)| Arg::from_value(value).map(|arg| (key, arg)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(Arg::Object)
            }
            other => Ok(Arg::Literal(other)),
        }
    }

    /// Encode the argument tree back to its wire value
    pub fn to_value(&self) -> Value {
        match self {
            Arg::Literal(value) => value.clone(),
            Arg::Array(items) => Value::Array(items.iter().map(Arg::to_value).collect()),
            Arg::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, arg)| (key.clone(), arg.to_value()))
                    .collect(),
            ),
            Arg::Expression(expr) => expr.to_wire(),
        }
    }

    pub fn empty_object() -> Self {
        Arg::Object(BTreeMap::new())
    }

    pub fn var(path: impl Into<String>) -> Self {
        Arg::Expression(Expression::Var(path.into()))
    }

    pub fn template(engine: TemplateEngine, template: impl Into<String>) -> Self {
        Arg::Expression(Expression::Template {
            engine,
            template: template.into(),
        })
    }

    pub fn pipeline(pipeline: Pipeline) -> Self {
        Arg::Expression(Expression::Pipeline(pipeline))
    }

    /// Whether the tree contains no expressions at all
    pub fn is_static(&self) -> bool {
        match self {
            Arg::Literal(_) => true,
            Arg::Array(items) => items.iter().all(Arg::is_static),
            Arg::Object(map) => map.values().all(Arg::is_static),
            Arg::Expression(_) => false,
        }
    }

    /// Visit every expression leaf, depth first
    pub fn for_each_expression<'a>(&'a self, f: &mut dyn FnMut(&'a Expression)) {
        match self {
            Arg::Literal(_) => {}
            Arg::Array(items) => items.iter().for_each(|item| item.for_each_expression(f)),
            Arg::Object(map) => map.values().for_each(|item| item.for_each_expression(f)),
            Arg::Expression(expr) => {
                f(expr);
                if let Expression::Defer(inner) = expr {
                    inner.for_each_expression(f);
                }
            }
        }
    }

    /// Parse every var path and template in the tree without rendering
    pub fn check(&self) -> Result<(), ExpressionError> {
        let mut result = Ok(());
        self.for_each_expression(&mut |expr| {
            if result.is_err() {
                return;
            }
            result = match expr {
                Expression::Var(path) => VarPath::parse(path).map(|_| ()),
                Expression::Template { engine, template } => {
                    Template::parse(*engine, template).map(|_| ())
                }
                Expression::Pipeline(_) | Expression::Defer(_) => Ok(()),
            };
        });
        result
    }
}

impl Default for Arg {
    fn default() -> Self {
        Arg::empty_object()
    }
}

impl From<Value> for Arg {
    /// Wraps the value as a literal without decoding expressions
    fn from(value: Value) -> Self {
        Arg::Literal(value)
    }
}

impl Serialize for Arg {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Arg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Arg::from_value(value).map_err(serde::de::Error::custom)
    }
}
