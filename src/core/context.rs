//! Pipeline context - the bindings visible to a step

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Binding holding the pipeline input
pub const INPUT_KEY: &str = "@input";

/// Binding holding the mod/run options
pub const OPTIONS_KEY: &str = "@options";

/// Immutable key/value mapping of `@`-prefixed bindings
///
/// Contexts are never mutated in place: every binding operation returns a new
/// context, so a context handed to a step (or captured by a pipeline closure)
/// cannot observe later bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    bindings: Arc<Map<String, Value>>,
}

impl Context {
    /// Create a context with the two base bindings
    pub fn new(input: Value, options: Value) -> Self {
        let mut bindings = Map::new();
        bindings.insert(INPUT_KEY.to_string(), input);
        bindings.insert(OPTIONS_KEY.to_string(), options);
        Self {
            bindings: Arc::new(bindings),
        }
    }

    /// Create a context with `@input` only; `@options` is an empty object
    pub fn from_input(input: Value) -> Self {
        Self::new(input, Value::Object(Map::new()))
    }

    /// Look up a binding by its full key (e.g. `@input`)
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bindings.get(key)
    }

    /// Whether the binding exists
    pub fn contains(&self, key: &str) -> bool {
        self.bindings.contains_key(key)
    }

    /// All binding keys, in key order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.bindings.keys()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Return a new context with `name` bound to `value`
    ///
    /// `name` may be given with or without the `@` prefix. An existing
    /// binding of the same name is shadowed in the returned context only.
    pub fn with_binding(&self, name: &str, value: Value) -> Self {
        let mut bindings = (*self.bindings).clone();
        bindings.insert(binding_key(name), value);
        Self {
            bindings: Arc::new(bindings),
        }
    }

    /// Return a new context overlaid with `extra`; `extra` wins on collision
    pub fn with_bindings<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut bindings = (*self.bindings).clone();
        for (name, value) in extra {
            bindings.insert(binding_key(&name), value);
        }
        Self {
            bindings: Arc::new(bindings),
        }
    }

    /// The context as a plain JSON object
    pub fn to_value(&self) -> Value {
        Value::Object((*self.bindings).clone())
    }
}

/// Normalize a binding name to its `@`-prefixed key
pub fn binding_key(name: &str) -> String {
    if name.starts_with('@') {
        name.to_string()
    } else {
        format!("@{}", name)
    }
}
