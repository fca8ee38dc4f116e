//! Shared state store
//!
//! Named state objects readable and writable by bricks, with a broadcast
//! channel announcing every write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Which state object a read or write targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateNamespace {
    /// Visible to every run
    Shared,
    /// Private to one mod; the scope key is the mod id
    Mod,
}

/// How a write combines with the current state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Replace,
    /// Top-level keys of the write replace those of the current state
    Shallow,
    /// Objects merge recursively; other values replace
    Deep,
}

/// Announced after every write
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub namespace: StateNamespace,
    pub scope_key: Option<String>,
    /// State after the write
    pub state: Value,
}

impl StateChange {
    pub fn is_for(&self, namespace: StateNamespace, scope_key: Option<&str>) -> bool {
        self.namespace == namespace && self.scope_key.as_deref() == scope_key
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("state must be a JSON object")]
    NotAnObject,

    #[error("the mod namespace requires a mod id")]
    MissingScope,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(
        &self,
        namespace: StateNamespace,
        scope_key: Option<&str>,
    ) -> Result<Value, StateError>;

    /// Write `data` and return the resulting state
    async fn set_state(
        &self,
        namespace: StateNamespace,
        scope_key: Option<&str>,
        data: Value,
        strategy: MergeStrategy,
    ) -> Result<Value, StateError>;

    /// Receive every subsequent change, across all namespaces
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;
}

type SlotKey = (StateNamespace, Option<String>);

/// Process-local state store
///
/// The lock is never held across an await point.
pub struct InMemoryStateStore {
    states: Mutex<HashMap<SlotKey, Value>>,
    changes: broadcast::Sender<StateChange>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            states: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn slot_key(namespace: StateNamespace, scope_key: Option<&str>) -> Result<SlotKey, StateError> {
        match namespace {
            StateNamespace::Shared => Ok((namespace, None)),
            StateNamespace::Mod => scope_key
                .map(|scope| (namespace, Some(scope.to_string())))
                .ok_or(StateError::MissingScope),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_state(
        &self,
        namespace: StateNamespace,
        scope_key: Option<&str>,
    ) -> Result<Value, StateError> {
        let key = Self::slot_key(namespace, scope_key)?;
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    async fn set_state(
        &self,
        namespace: StateNamespace,
        scope_key: Option<&str>,
        data: Value,
        strategy: MergeStrategy,
    ) -> Result<Value, StateError> {
        if !data.is_object() {
            return Err(StateError::NotAnObject);
        }
        let key = Self::slot_key(namespace, scope_key)?;

        let next = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            let current = states
                .remove(&key)
                .unwrap_or_else(|| Value::Object(Map::new()));
            let next = merge(current, data, strategy);
            states.insert(key.clone(), next.clone());
            next
        };

        // No receivers is fine
        let _ = self.changes.send(StateChange {
            namespace,
            scope_key: key.1,
            state: next.clone(),
        });
        debug!(?namespace, "State updated");
        Ok(next)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

/// Combine `current` with `data` according to `strategy`
pub fn merge(current: Value, data: Value, strategy: MergeStrategy) -> Value {
    match strategy {
        MergeStrategy::Replace => data,
        MergeStrategy::Shallow => match (current, data) {
            (Value::Object(mut current), Value::Object(data)) => {
                current.extend(data);
                Value::Object(current)
            }
            (_, data) => data,
        },
        MergeStrategy::Deep => deep_merge(current, data),
    }
}

fn deep_merge(current: Value, data: Value) -> Value {
    match (current, data) {
        (Value::Object(mut current), Value::Object(data)) => {
            for (key, value) in data {
                let merged = match current.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                current.insert(key, merged);
            }
            Value::Object(current)
        }
        (_, data) => data,
    }
}
