//! Cache-coalescing brick
//!
//! Memoizes the result of a body pipeline in a shared state slot. Concurrent
//! callers for the same key share one in-flight computation; every write is
//! fenced by the request id of the attempt that made it, so a stale attempt
//! can never overwrite a newer one.

use crate::bricks::{closure_arg, Brick, BrickOptions};
use crate::core::Branch;
use crate::execution::{BrickError, SerializedError};
use crate::store::{MergeStrategy, StateChange, StateError, StateNamespace, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// State of one cache key, as stored and as shown to status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSlot {
    pub request_id: Uuid,
    pub is_uninitialized: bool,
    /// Fetching with no previous data
    pub is_loading: bool,
    pub is_fetching: bool,
    pub is_success: bool,
    pub is_error: bool,
    /// Result of the latest settled attempt; `null` while fetching
    pub current_data: Option<Value>,
    /// Last successful result, kept across refreshes
    pub data: Option<Value>,
    pub error: Option<SerializedError>,
    /// Epoch milliseconds after which `data` is stale
    pub expires_at: Option<i64>,
}

impl CacheSlot {
    fn fetching(request_id: Uuid, previous: Option<&CacheSlot>) -> Self {
        let data = previous.and_then(|slot| slot.data.clone());
        Self {
            request_id,
            is_uninitialized: false,
            is_loading: data.is_none(),
            is_fetching: true,
            is_success: false,
            is_error: false,
            current_data: None,
            data,
            error: previous.and_then(|slot| slot.error.clone()),
            expires_at: None,
        }
    }

    fn succeeded(request_id: Uuid, data: Value, expires_at: Option<i64>) -> Self {
        Self {
            request_id,
            is_uninitialized: false,
            is_loading: false,
            is_fetching: false,
            is_success: true,
            is_error: false,
            current_data: Some(data.clone()),
            data: Some(data),
            error: None,
            expires_at,
        }
    }

    fn failed(request_id: Uuid, error: SerializedError, previous: Option<&CacheSlot>) -> Self {
        Self {
            request_id,
            is_uninitialized: false,
            is_loading: false,
            is_fetching: false,
            is_success: false,
            is_error: true,
            current_data: None,
            data: previous.and_then(|slot| slot.data.clone()),
            error: Some(error),
            expires_at: None,
        }
    }

    /// Decode the slot stored under `key`; absent or `null` means uninitialized
    pub fn decode(key: &str, raw: Option<&Value>) -> Result<Option<Self>, CacheError> {
        let corrupted = |reason: String| CacheError::Corrupted {
            key: key.to_string(),
            reason,
        };
        let raw = match raw {
            None | Some(Value::Null) => return Ok(None),
            Some(raw) => raw,
        };
        let slot: CacheSlot =
            serde_json::from_value(raw.clone()).map_err(|e| corrupted(e.to_string()))?;
        if slot.is_success && slot.is_error {
            return Err(corrupted("slot is both successful and failed".to_string()));
        }
        if slot.is_fetching && (slot.is_success || slot.is_error) {
            return Err(corrupted("slot is fetching and settled".to_string()));
        }
        Ok(Some(slot))
    }

    fn is_fresh(&self, now_ms: i64) -> bool {
        self.is_success && self.expires_at.map_or(true, |expires_at| expires_at > now_ms)
    }

    /// Outcome for a caller that waited on this slot
    fn settled_result(&self) -> Result<Value, BrickError> {
        if self.is_success {
            Ok(self.data.clone().unwrap_or(Value::Null))
        } else {
            let error = self.error.clone().unwrap_or_else(|| SerializedError {
                name: "Error".to_string(),
                message: "cached computation failed".to_string(),
                details: None,
            });
            Err(BrickError::Business {
                message: error.message,
                details: error.details,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("cache corrupted for key '{key}': {reason}")]
    Corrupted { key: String, reason: String },

    #[error("cannot encode cache slot for key '{key}': {reason}")]
    Encode { key: String, reason: String },

    #[error("request {request_id} for key '{key}' was superseded")]
    Superseded { key: String, request_id: Uuid },

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<CacheError> for BrickError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Corrupted { ref key, .. } => BrickError::Business {
                details: Some(json!({ "key": key })),
                message: error.to_string(),
            },
            CacheError::Superseded { .. } => BrickError::Superseded(error.to_string()),
            CacheError::Encode { .. } => BrickError::Other(anyhow::Error::new(error)),
            CacheError::State(e) => BrickError::Other(anyhow::Error::new(e)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheArgs {
    key: String,
    /// Milliseconds a successful result stays fresh; forever when absent
    #[serde(default)]
    ttl: Option<u64>,
    #[serde(default)]
    force_fetch: bool,
}

/// `@core/cache`: runs `body` at most once at a time per key
pub struct CacheBrick {
    store: Arc<dyn StateStore>,
}

impl CacheBrick {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn location(options: &BrickOptions) -> (StateNamespace, Option<String>) {
        match &options.meta.mod_id {
            Some(mod_id) => (StateNamespace::Mod, Some(mod_id.clone())),
            None => (StateNamespace::Shared, None),
        }
    }

    async fn read_slot(
        &self,
        namespace: StateNamespace,
        scope: Option<&str>,
        key: &str,
    ) -> Result<Option<CacheSlot>, CacheError> {
        let state = self.store.get_state(namespace, scope).await?;
        CacheSlot::decode(key, state.get(key))
    }

    async fn write_slot(
        &self,
        namespace: StateNamespace,
        scope: Option<&str>,
        key: &str,
        slot: &CacheSlot,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_value(slot).map_err(|e| CacheError::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let mut update = Map::new();
        update.insert(key.to_string(), encoded);
        self.store
            .set_state(namespace, scope, Value::Object(update), MergeStrategy::Shallow)
            .await?;
        Ok(())
    }

    /// Wait for the in-flight attempt `request_id` to settle
    async fn await_settled(
        &self,
        mut changes: broadcast::Receiver<StateChange>,
        namespace: StateNamespace,
        scope: Option<&str>,
        key: &str,
        request_id: Uuid,
        options: &BrickOptions,
    ) -> Result<Value, BrickError> {
        loop {
            let notified = tokio::select! {
                _ = options.cancel.cancelled() => return Err(BrickError::Cancelled),
                change = changes.recv() => match change {
                    Ok(change) if change.is_for(namespace, scope) => {
                        CacheSlot::decode(key, change.state.get(key))?
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        options.log.debug(&format!("Missed {} state changes; re-reading", skipped));
                        self.read_slot(namespace, scope, key).await?
                    }
                    Err(RecvError::Closed) => {
                        return Err(BrickError::Other(anyhow::anyhow!("state store closed")));
                    }
                },
            };

            // Notifications queued before we learned the request id may be
            // stale, so a mismatch is confirmed against the current slot
            let slot = match notified {
                Some(slot) if slot.request_id == request_id => Some(slot),
                _ => self.read_slot(namespace, scope, key).await?,
            };

            match slot {
                Some(slot) if slot.request_id == request_id => {
                    if !slot.is_fetching {
                        return slot.settled_result();
                    }
                }
                // Replaced by another attempt, or cleared
                _ => {
                    return Err(CacheError::Superseded {
                        key: key.to_string(),
                        request_id,
                    }
                    .into());
                }
            }
        }
    }
}

#[async_trait]
impl Brick for CacheBrick {
    fn id(&self) -> &str {
        "@core/cache"
    }

    fn description(&self) -> &str {
        "Cache the result of the body pipeline in shared state"
    }

    async fn run(&self, args: Value, options: BrickOptions) -> Result<Value, BrickError> {
        let body = closure_arg(&args, "body")?;
        let args: CacheArgs = serde_json::from_value(args)
            .map_err(|e| BrickError::InvalidArgs(e.to_string()))?;
        let (namespace, scope) = Self::location(&options);
        let scope = scope.as_deref();
        let key = args.key.as_str();

        // Subscribe before reading so the settling write cannot be missed
        let changes = self.store.subscribe();
        let previous = self.read_slot(namespace, scope, key).await?;

        if let Some(slot) = &previous {
            if slot.is_fetching {
                options.log.debug(&format!("Waiting on in-flight request for '{}'", key));
                return self
                    .await_settled(changes, namespace, scope, key, slot.request_id, &options)
                    .await;
            }
            if !args.force_fetch && slot.is_fresh(Utc::now().timestamp_millis()) {
                options.log.debug(&format!("Cache hit for '{}'", key));
                return Ok(slot.data.clone().unwrap_or(Value::Null));
            }
        }
        drop(changes);

        let request_id = Uuid::new_v4();
        self.write_slot(
            namespace,
            scope,
            key,
            &CacheSlot::fetching(request_id, previous.as_ref()),
        )
        .await?;

        // Another caller may have read the slot before our claim landed and
        // written its own; whoever's request id is stored now runs the body
        let changes = self.store.subscribe();
        match self.read_slot(namespace, scope, key).await? {
            Some(slot) if slot.request_id == request_id => drop(changes),
            Some(slot) if slot.is_fetching => {
                options.log.debug(&format!("Lost the claim for '{}'; joining", key));
                return self
                    .await_settled(changes, namespace, scope, key, slot.request_id, &options)
                    .await;
            }
            Some(slot) => return slot.settled_result(),
            None => {
                return Err(CacheError::Superseded {
                    key: key.to_string(),
                    request_id,
                }
                .into());
            }
        }

        let result = options
            .run_closure(&body, Vec::new(), Branch::new("body", 0))
            .await;

        let current = self.read_slot(namespace, scope, key).await?;
        if current.as_ref().map(|slot| slot.request_id) != Some(request_id) {
            options.log.warn(&format!("Discarding superseded result for '{}'", key));
            return Err(CacheError::Superseded {
                key: key.to_string(),
                request_id,
            }
            .into());
        }

        match result {
            Ok(data) => {
                let expires_at = args
                    .ttl
                    .map(|ttl| Utc::now().timestamp_millis().saturating_add(ttl as i64));
                self.write_slot(
                    namespace,
                    scope,
                    key,
                    &CacheSlot::succeeded(request_id, data.clone(), expires_at),
                )
                .await?;
                Ok(data)
            }
            Err(error) => {
                self.write_slot(
                    namespace,
                    scope,
                    key,
                    &CacheSlot::failed(request_id, error.serialize(), previous.as_ref()),
                )
                .await?;
                Err(error.into())
            }
        }
    }
}
