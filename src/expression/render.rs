//! Argument rendering against a context

use crate::core::Context;
use crate::expression::path::{Lookup, VarPath};
use crate::expression::{Arg, Expression, ExpressionError, PipelineClosure, Template};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Rendering switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Treat a missing `var` path as an error instead of a missing value
    pub strict: bool,
}

impl RenderOptions {
    pub fn strict() -> Self {
        Self { strict: true }
    }
}

/// Why a single expression failed to render
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderErrorKind {
    #[error("undefined path '{path}'")]
    UndefinedPath { path: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("filter '{filter}' failed: {message}")]
    Filter { filter: String, message: String },
}

/// A render failure at a location inside the argument tree
#[derive(Debug, Clone, PartialEq)]
pub struct RenderError {
    /// Argument location, e.g. `message` or `items[2].name`; empty for the root
    pub location: String,
    pub kind: RenderErrorKind,
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.location, self.kind)
        }
    }
}

/// Every render failure of one argument tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderErrors(pub Vec<RenderError>);

impl RenderErrors {
    pub fn iter(&self) -> impl Iterator<Item = &RenderError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Paths reported as undefined, in tree order
    pub fn undefined_paths(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|error| match &error.kind {
                RenderErrorKind::UndefinedPath { path } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for RenderErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for RenderError {}

impl std::error::Error for RenderErrors {}

/// Result of rendering one expression
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Value(Value),
    /// The path was absent; distinct from a present `null`
    Missing { path: String },
}

/// Render a single expression
pub fn render_expression(
    expr: &Expression,
    ctx: &Context,
    options: RenderOptions,
) -> Result<Rendered, RenderErrorKind> {
    match expr {
        Expression::Var(source) => {
            let path = VarPath::parse(source)?;
            match path.lookup(ctx) {
                Lookup::Found(value) => Ok(Rendered::Value(value.clone())),
                Lookup::Missing { optional } if options.strict && !optional => {
                    Err(RenderErrorKind::UndefinedPath {
                        path: path.to_string(),
                    })
                }
                Lookup::Missing { .. } => Ok(Rendered::Missing {
                    path: path.to_string(),
                }),
            }
        }
        Expression::Template { engine, template } => {
            let parsed = Template::parse(*engine, template)?;
            parsed.render(ctx).map(|text| Rendered::Value(Value::String(text)))
        }
        Expression::Pipeline(pipeline) => Ok(Rendered::Value(
            PipelineClosure::capture(pipeline, ctx).to_value(),
        )),
        Expression::Defer(_) => Ok(Rendered::Value(expr.to_wire())),
    }
}

/// Render an argument tree; `Ok(None)` means the whole value was missing
///
/// Each subtree stops at its first error, but sibling subtrees still render
/// so that every failure of the tree is reported together.
pub fn render_arg(
    arg: &Arg,
    ctx: &Context,
    options: RenderOptions,
) -> Result<Option<Value>, RenderErrors> {
    let mut errors = Vec::new();
    let rendered = render_node(arg, ctx, options, "", &mut errors);
    match rendered {
        Some(value) if errors.is_empty() => Ok(value),
        _ => Err(RenderErrors(errors)),
    }
}

/// Render a brick's configuration object; a missing root renders as `null`
pub fn render_config(arg: &Arg, ctx: &Context, options: RenderOptions) -> Result<Value, RenderErrors> {
    render_arg(arg, ctx, options).map(|value| value.unwrap_or(Value::Null))
}

// Outer `None` = subtree failed (errors recorded); inner `None` = missing value.
fn render_node(
    arg: &Arg,
    ctx: &Context,
    options: RenderOptions,
    location: &str,
    errors: &mut Vec<RenderError>,
) -> Option<Option<Value>> {
    match arg {
        Arg::Literal(value) => Some(Some(value.clone())),
        Arg::Expression(expr) => match render_expression(expr, ctx, options) {
            Ok(Rendered::Value(value)) => Some(Some(value)),
            Ok(Rendered::Missing { .. }) => Some(None),
            Err(kind) => {
                errors.push(RenderError {
                    location: location.to_string(),
                    kind,
                });
                None
            }
        },
        Arg::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut failed = false;
            for (index, item) in items.iter().enumerate() {
                let child = format!("{}[{}]", location, index);
                match render_node(item, ctx, options, &child, errors) {
                    Some(value) => out.push(value.unwrap_or(Value::Null)),
                    None => failed = true,
                }
            }
            (!failed).then_some(Some(Value::Array(out)))
        }
        Arg::Object(map) => {
            let mut out = Map::new();
            let mut failed = false;
            for (key, item) in map {
                let child = if location.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", location, key)
                };
                match render_node(item, ctx, options, &child, errors) {
                    Some(Some(value)) => {
                        out.insert(key.clone(), value);
                    }
                    Some(None) => {}
                    None => failed = true,
                }
            }
            (!failed).then_some(Some(Value::Object(out)))
        }
    }
}
