//! Pipeline domain model

use crate::core::step::BrickConfig;
use crate::expression::{Arg, Expression};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// An ordered sequence of steps
///
/// Deserializes from either an array of steps or a single step object, which
/// is treated as a one-element pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Pipeline {
    steps: Vec<BrickConfig>,
}

impl Pipeline {
    pub fn new(steps: Vec<BrickConfig>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[BrickConfig] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Array(
            self.steps
                .iter()
                .map(|step| serde_json::to_value(step).unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Pipelines embedded in step arguments, one level down
    pub fn nested_pipelines(&self) -> Vec<&Pipeline> {
        let mut nested = Vec::new();
        for step in &self.steps {
            collect_pipelines(&step.config, &mut nested);
            if let Some(condition) = &step.condition {
                collect_pipelines(condition, &mut nested);
            }
        }
        nested
    }

    /// Every instance id in this pipeline and all nested pipelines
    pub fn instance_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        self.walk(&mut |step| ids.push(step.instance_id));
        ids
    }

    /// Visit every step, including those of nested pipelines, depth first
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a BrickConfig)) {
        for step in &self.steps {
            f(step);
            let mut nested = Vec::new();
            collect_pipelines(&step.config, &mut nested);
            if let Some(condition) = &step.condition {
                collect_pipelines(condition, &mut nested);
            }
            for pipeline in nested {
                pipeline.walk(f);
            }
        }
    }

    /// Instance ids that appear more than once, across nesting levels
    pub fn duplicate_instance_ids(&self) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for id in self.instance_ids() {
            if !seen.insert(id) && !duplicates.contains(&id) {
                duplicates.push(id);
            }
        }
        duplicates
    }
}

fn collect_pipelines<'a>(arg: &'a Arg, out: &mut Vec<&'a Pipeline>) {
    arg.for_each_expression(&mut |expr| {
        if let Expression::Pipeline(pipeline) = expr {
            out.push(pipeline);
        }
    });
}

impl From<Vec<BrickConfig>> for Pipeline {
    fn from(steps: Vec<BrickConfig>) -> Self {
        Self::new(steps)
    }
}

impl From<BrickConfig> for Pipeline {
    fn from(step: BrickConfig) -> Self {
        Self::new(vec![step])
    }
}

impl<'de> Deserialize<'de> for Pipeline {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            Many(Vec<BrickConfig>),
            One(Box<BrickConfig>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::Many(steps) => Pipeline::new(steps),
            OneOrMany::One(step) => Pipeline::new(vec![*step]),
        })
    }
}
