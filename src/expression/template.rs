//! Template dialects
//!
//! Both dialects interpolate `{{ path }}` placeholders. Mustache additionally
//! accepts `{{{ path }}}`, `{{& path }}` and `{{! comment }}`; nunjucks accepts
//! `{# comment #}` and a pipe of filters after the path.

use crate::core::Context;
use crate::expression::path::{Lookup, VarPath};
use crate::expression::render::RenderErrorKind;
use crate::expression::{ExpressionError, TemplateEngine};
use serde_json::Value;

/// A parsed template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    engine: TemplateEngine,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Output { path: VarPath, filters: Vec<Filter> },
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    name: String,
    args: Vec<Value>,
}

const FILTERS: &[&str] = &[
    "upper",
    "lower",
    "trim",
    "capitalize",
    "length",
    "first",
    "last",
    "join",
    "default",
    "dump",
    "json",
];

impl Template {
    pub fn parse(engine: TemplateEngine, source: &str) -> Result<Self, ExpressionError> {
        let mut nodes = Vec::new();
        let mut rest = source;

        loop {
            let next_tag = match engine {
                TemplateEngine::Mustache => rest.find("{{"),
                TemplateEngine::Nunjucks => ["{{", "{#", "{%"]
                    .iter()
                    .filter_map(|open| rest.find(open))
                    .min(),
            };
            let Some(open) = next_tag else {
                if !rest.is_empty() {
                    nodes.push(Node::Text(rest.to_string()));
                }
                break;
            };
            if open > 0 {
                nodes.push(Node::Text(rest[..open].to_string()));
            }
            rest = &rest[open..];

            match engine {
                TemplateEngine::Mustache => rest = parse_mustache_tag(rest, &mut nodes)?,
                TemplateEngine::Nunjucks => rest = parse_nunjucks_tag(rest, &mut nodes)?,
            }
        }

        Ok(Self { engine, nodes })
    }

    pub fn engine(&self) -> TemplateEngine {
        self.engine
    }

    /// Whether the source contains anything this dialect would interpret
    pub fn has_markers(engine: TemplateEngine, source: &str) -> bool {
        match engine {
            TemplateEngine::Mustache => source.contains("{{"),
            TemplateEngine::Nunjucks => {
                source.contains("{{") || source.contains("{#") || source.contains("{%")
            }
        }
    }

    /// Paths referenced by the template's placeholders
    pub fn paths(&self) -> impl Iterator<Item = &VarPath> {
        self.nodes.iter().filter_map(|node| match node {
            Node::Output { path, .. } => Some(path),
            Node::Text(_) => None,
        })
    }

    pub fn render(&self, ctx: &Context) -> Result<String, RenderErrorKind> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Output { path, filters } => {
                    let (value, optional) = match path.lookup(ctx) {
                        Lookup::Found(value) => (Some(value.clone()), false),
                        Lookup::Missing { optional } => (None, optional),
                    };
                    let mut value = value;
                    for filter in filters {
                        if value.is_none() && optional && filter.name != "default" {
                            continue;
                        }
                        value = apply_filter(filter, value, path)?;
                    }
                    match value {
                        Some(value) => out.push_str(&stringify(&value)),
                        None if optional => {}
                        None => {
                            return Err(RenderErrorKind::UndefinedPath {
                                path: path.to_string(),
                            })
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn parse_mustache_tag<'a>(rest: &'a str, nodes: &mut Vec<Node>) -> Result<&'a str, ExpressionError> {
    let (inner, after) = if let Some(body) = rest.strip_prefix("{{{") {
        let close = body
            .find("}}}")
            .ok_or_else(|| unclosed("{{{"))?;
        (&body[..close], &body[close + 3..])
    } else {
        let body = &rest[2..];
        let close = body.find("}}").ok_or_else(|| unclosed("{{"))?;
        (&body[..close], &body[close + 2..])
    };

    let inner = inner.trim();
    match inner.chars().next() {
        Some('!') => {}
        Some('&') => nodes.push(Node::Output {
            path: VarPath::parse(&inner[1..])?,
            filters: Vec::new(),
        }),
        Some(c @ ('#' | '^' | '/' | '>' | '=')) => {
            return Err(ExpressionError::InvalidTemplate(format!(
                "mustache tag '{{{{{}' is not supported",
                c
            )))
        }
        _ => nodes.push(Node::Output {
            path: VarPath::parse(inner)?,
            filters: Vec::new(),
        }),
    }
    Ok(after)
}

fn parse_nunjucks_tag<'a>(rest: &'a str, nodes: &mut Vec<Node>) -> Result<&'a str, ExpressionError> {
    if let Some(body) = rest.strip_prefix("{#") {
        let close = body.find("#}").ok_or_else(|| unclosed("{#"))?;
        return Ok(&body[close + 2..]);
    }
    if rest.starts_with("{%") {
        return Err(ExpressionError::InvalidTemplate(
            "nunjucks block tags are not supported".to_string(),
        ));
    }

    let body = &rest[2..];
    let close = body.find("}}").ok_or_else(|| unclosed("{{"))?;
    let inner = body[..close].trim().trim_start_matches('-').trim_end_matches('-');

    let mut parts = split_outside_quotes(inner, '|').into_iter();
    let path = VarPath::parse(parts.next().unwrap_or_default())?;
    let filters = parts.map(parse_filter).collect::<Result<Vec<_>, _>>()?;
    nodes.push(Node::Output { path, filters });
    Ok(&body[close + 2..])
}

fn parse_filter(source: &str) -> Result<Filter, ExpressionError> {
    let source = source.trim();
    let (name, args) = match source.find('(') {
        Some(open) => {
            let close = source
                .rfind(')')
                .filter(|close| *close > open)
                .ok_or_else(|| {
                    ExpressionError::InvalidTemplate(format!("unbalanced filter call '{}'", source))
                })?;
            let args = split_outside_quotes(&source[open + 1..close], ',')
                .into_iter()
                .filter(|arg| !arg.trim().is_empty())
                .map(parse_literal)
                .collect::<Result<Vec<_>, _>>()?;
            (source[..open].trim(), args)
        }
        None => (source, Vec::new()),
    };

    if !FILTERS.contains(&name) {
        return Err(ExpressionError::InvalidTemplate(format!("unknown filter '{}'", name)));
    }
    Ok(Filter {
        name: name.to_string(),
        args,
    })
}

fn parse_literal(source: &str) -> Result<Value, ExpressionError> {
    let source = source.trim();
    let quoted = source.len() >= 2
        && ((source.starts_with('\'') && source.ends_with('\''))
            || (source.starts_with('"') && source.ends_with('"')));
    if quoted {
        return Ok(Value::String(source[1..source.len() - 1].replace("\\'", "'")));
    }
    serde_json::from_str(source)
        .map_err(|_| ExpressionError::InvalidTemplate(format!("invalid filter argument '{}'", source)))
}

fn split_outside_quotes(source: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in source.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == separator => {
                parts.push(&source[start..i]);
                start = i + c.len_utf8();
            }
            None => {}
        }
    }
    parts.push(&source[start..]);
    parts
}

fn unclosed(open: &str) -> ExpressionError {
    ExpressionError::InvalidTemplate(format!("unclosed '{}'", open))
}

fn apply_filter(
    filter: &Filter,
    value: Option<Value>,
    path: &VarPath,
) -> Result<Option<Value>, RenderErrorKind> {
    if filter.name == "default" {
        return Ok(match value {
            Some(Value::Null) | None => Some(filter.args.first().cloned().unwrap_or(Value::Null)),
            present => present,
        });
    }

    let Some(value) = value else {
        return Err(RenderErrorKind::UndefinedPath {
            path: path.to_string(),
        });
    };
    let fail = |message: &str| RenderErrorKind::Filter {
        filter: filter.name.clone(),
        message: message.to_string(),
    };

    let result = match filter.name.as_str() {
        "upper" => Value::String(stringify(&value).to_uppercase()),
        "lower" => Value::String(stringify(&value).to_lowercase()),
        "trim" => Value::String(stringify(&value).trim().to_string()),
        "capitalize" => {
            let text = stringify(&value).to_lowercase();
            let mut chars = text.chars();
            Value::String(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            })
        }
        "length" => match &value {
            Value::String(s) => Value::from(s.chars().count()),
            Value::Array(items) => Value::from(items.len()),
            Value::Object(map) => Value::from(map.len()),
            _ => return Err(fail("value has no length")),
        },
        "first" | "last" => {
            let pick_first = filter.name == "first";
            match &value {
                Value::Array(items) => {
                    let item = if pick_first { items.first() } else { items.last() };
                    item.cloned().unwrap_or(Value::Null)
                }
                Value::String(s) => {
                    let c = if pick_first { s.chars().next() } else { s.chars().last() };
                    c.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null)
                }
                _ => return Err(fail("expected an array or string")),
            }
        }
        "join" => {
            let separator = filter
                .args
                .first()
                .map(stringify)
                .unwrap_or_else(|| ",".to_string());
            match &value {
                Value::Array(items) => Value::String(
                    items.iter().map(stringify).collect::<Vec<_>>().join(&separator),
                ),
                _ => return Err(fail("expected an array")),
            }
        }
        "dump" | "json" => Value::String(value.to_string()),
        _ => return Err(fail("unknown filter")),
    };
    Ok(Some(result))
}

/// String form of a value when interpolated into a template
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
