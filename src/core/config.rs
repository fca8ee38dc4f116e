//! Pipeline definitions from YAML or JSON

use crate::core::{Context, Pipeline};
use crate::expression::{
    Expression, RenderOptions, Template, TemplateEngine, TYPE_KEY, VALUE_KEY,
};
use anyhow::{Context as _, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::OnceLock;

/// Expression dialect a definition was written against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    /// Bare strings are templates; placeholders name input fields directly
    V1,
    /// Bare strings are templates over the `@`-prefixed context
    V2,
    /// Explicit expression objects only
    #[default]
    V3,
}

impl ApiVersion {
    pub fn is_legacy(&self) -> bool {
        !matches!(self, ApiVersion::V3)
    }
}

/// Per-step `templateEngine` setting of legacy definitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyEngine {
    #[default]
    Mustache,
    Nunjucks,
    Handlebars,
    Var,
}

/// A pipeline plus the run inputs it ships with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    /// Always `v3` once loaded
    #[serde(default)]
    pub api_version: ApiVersion,

    pub name: String,

    /// Default `@input` binding
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,

    /// Default `@options` binding
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,

    /// Owner of the `mod` state namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_id: Option<String>,

    pub pipeline: Pipeline,
}

impl PipelineDefinition {
    /// Load a definition; `.json` files are parsed as JSON, anything else as YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(yaml).context("Invalid pipeline YAML")?;
        Self::from_value(raw)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text).context("Invalid pipeline JSON")?;
        Self::from_value(raw)
    }

    /// Upgrade a raw definition to the current dialect, decode and validate it
    pub fn from_value(mut raw: Value) -> Result<Self> {
        let version: ApiVersion = match raw.get("apiVersion") {
            Some(v) => serde_json::from_value(v.clone()).context("Unsupported apiVersion")?,
            None => ApiVersion::V3,
        };

        if version.is_legacy() {
            let pipeline = raw
                .get_mut("pipeline")
                .ok_or_else(|| anyhow::anyhow!("Pipeline definition has no 'pipeline'"))?;
            upgrade_pipeline(pipeline, version)?;
            if let Some(map) = raw.as_object_mut() {
                map.insert("apiVersion".to_string(), json!("v3"));
            }
        }

        let definition: PipelineDefinition =
            serde_json::from_value(raw).context("Malformed pipeline definition")?;
        definition.validate()?;
        Ok(definition)
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        validate_pipeline(&self.pipeline)
    }

    /// Initial context for a run, with `input` overriding the default input
    pub fn context(&self, input: Option<Value>) -> Context {
        let input = input.unwrap_or_else(|| self.input.clone());
        let input = if input.is_null() { json!({}) } else { input };
        let options = if self.options.is_null() {
            json!({})
        } else {
            self.options.clone()
        };
        Context::new(input, options)
    }
}

/// Check a pipeline (and every nested pipeline) for loadable shape
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<()> {
    let mut problems = Vec::new();
    pipeline.walk(&mut |step| {
        if step.id.trim().is_empty() {
            problems.push(format!("step {} has an empty brick id", step.instance_id));
        }
        if let Err(e) = step.config.check() {
            problems.push(format!("step '{}' config: {}", step.display_name(), e));
        }
        if let Some(Err(e)) = step.condition.as_ref().map(|c| c.check()) {
            problems.push(format!("step '{}' condition: {}", step.display_name(), e));
        }
    });

    for id in pipeline.duplicate_instance_ids() {
        problems.push(format!("duplicate instance id {}", id));
    }

    if !problems.is_empty() {
        anyhow::bail!("Invalid pipeline: {}", problems.join("; "));
    }
    Ok(())
}

/// Rewrite a legacy pipeline in place into explicit expression objects
fn upgrade_pipeline(pipeline: &mut Value, version: ApiVersion) -> Result<()> {
    match pipeline {
        Value::Array(steps) => steps
            .iter_mut()
            .try_for_each(|step| upgrade_step(step, version)),
        Value::Object(_) => upgrade_step(pipeline, version),
        _ => anyhow::bail!("Pipeline must be a step or a list of steps"),
    }
}

fn upgrade_step(step: &mut Value, version: ApiVersion) -> Result<()> {
    let Some(map) = step.as_object_mut() else {
        anyhow::bail!("Pipeline step must be an object");
    };

    let engine: LegacyEngine = match map.remove("templateEngine") {
        Some(engine) => serde_json::from_value(engine).context("Unknown templateEngine")?,
        None => LegacyEngine::default(),
    };
    if engine == LegacyEngine::Handlebars {
        let id = map.get("id").and_then(Value::as_str).unwrap_or("<unknown>");
        anyhow::bail!("Step '{}': handlebars templates are not supported", id);
    }

    if let Some(config) = map.get_mut("config") {
        upgrade_value(config, engine, version)?;
    }
    if let Some(condition) = map.get_mut("if") {
        upgrade_value(condition, engine, version)?;
    }
    Ok(())
}

fn upgrade_value(value: &mut Value, engine: LegacyEngine, version: ApiVersion) -> Result<()> {
    match value {
        Value::String(text) => {
            if let Some(expr) = upgrade_string(text, engine, version) {
                *value = expr;
            }
        }
        Value::Array(items) => {
            for item in items {
                upgrade_value(item, engine, version)?;
            }
        }
        Value::Object(map) if map.contains_key(TYPE_KEY) => {
            // Already explicit; only nested pipelines need their steps upgraded
            if map.get(TYPE_KEY).and_then(Value::as_str) == Some("pipeline") {
                if let Some(steps) = map.get_mut(VALUE_KEY) {
                    upgrade_pipeline(steps, version)?;
                }
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                upgrade_value(item, engine, version)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn upgrade_string(text: &str, engine: LegacyEngine, version: ApiVersion) -> Option<Value> {
    let kind = match engine {
        LegacyEngine::Var => {
            let path = if version == ApiVersion::V1 && !text.starts_with('@') {
                format!("@input.{}", text)
            } else if text.starts_with('@') {
                text.to_string()
            } else {
                return None;
            };
            return Some(Expression::Var(path).to_wire());
        }
        LegacyEngine::Nunjucks => TemplateEngine::Nunjucks,
        LegacyEngine::Mustache | LegacyEngine::Handlebars => TemplateEngine::Mustache,
    };

    if !Template::has_markers(kind, text) {
        return None;
    }
    let source = if version == ApiVersion::V1 {
        reroot_placeholders(text)
    } else {
        text.to_string()
    };
    Some(
        Expression::Template {
            engine: kind,
            template: source,
        }
        .to_wire(),
    )
}

/// v1 placeholders name input fields directly: `{{ name }}` means `{{ @input.name }}`
fn reroot_placeholders(text: &str) -> String {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PLACEHOLDER.get_or_init(|| Regex::new(r"(\{\{\{?-?\s*)([A-Za-z_]\w*)").ok());
    match pattern {
        Some(re) => re.replace_all(text, "${1}@input.${2}").into_owned(),
        None => text.to_string(),
    }
}

/// Runtime switches consumed by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// The host cannot display renderer output; renderers suspend with a continuation
    #[serde(default)]
    pub headless: bool,

    /// Missing `var` paths are render errors
    #[serde(default)]
    pub strict_render: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn strict_render(mut self, strict: bool) -> Self {
        self.strict_render = strict;
        self
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            strict: self.strict_render,
        }
    }
}
