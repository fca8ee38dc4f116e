//! Step domain model

use crate::expression::Arg;
use serde::{Deserialize, Serialize};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Identifier under which a step's result is bound for later steps
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputKey(String);

impl OutputKey {
    /// Output keys are plain identifiers: a letter followed by letters or digits.
    /// A leading `@` is accepted and stripped.
    pub fn new(key: impl Into<String>) -> Result<Self, String> {
        static IDENTIFIER: OnceLock<Option<Regex>> = OnceLock::new();
        let key: String = key.into();
        let bare = key.strip_prefix('@').unwrap_or(&key);
        let valid = IDENTIFIER
            .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").ok())
            .as_ref()
            .is_some_and(|re| re.is_match(bare));
        if valid {
            Ok(Self(bare.to_string()))
        } else {
            Err(format!("invalid output key '{}'", key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The context binding this key produces, e.g. `@result`
    pub fn binding(&self) -> String {
        format!("@{}", self.0)
    }
}

impl TryFrom<String> for OutputKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        OutputKey::new(value)
    }
}

impl From<OutputKey> for String {
    fn from(key: OutputKey) -> Self {
        key.0
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single brick invocation in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickConfig {
    /// Registry identifier of the brick to run
    pub id: String,

    /// Stable identity of this step, used to match trace records to configuration
    #[serde(default = "Uuid::new_v4")]
    pub instance_id: Uuid,

    /// Optional human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Arguments; leaves may be expressions
    #[serde(default)]
    pub config: Arg,

    /// Conditional guard; the step is skipped when it evaluates falsy
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Arg>,

    /// Binding for the step's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<OutputKey>,
}

impl BrickConfig {
    /// Create a step with a fresh instance id and empty configuration
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance_id: Uuid::new_v4(),
            label: None,
            config: Arg::empty_object(),
            condition: None,
            output_key: None,
        }
    }

    pub fn with_config(mut self, config: Arg) -> Self {
        self.config = config;
        self
    }

    pub fn with_condition(mut self, condition: Arg) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Set the output key, rejecting keys that are not identifiers
    pub fn with_output_key(mut self, key: &str) -> Result<Self, String> {
        self.output_key = Some(OutputKey::new(key)?);
        Ok(self)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Name used in logs: the label when present, else the brick id
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}
