//! Persistence layer for run traces

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteTraceStore;

use crate::execution::{TraceEntry, TraceExit, TraceSink};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of one traced run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,

    /// Number of trace entries (steps started)
    pub entries: usize,

    /// Number of trace exits (steps settled)
    pub exits: usize,

    /// Exits that carry an error
    pub errors: usize,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A trace sink that can be queried afterwards
#[async_trait::async_trait]
pub trait TraceStore: TraceSink {
    /// Entries of a run in recording order
    async fn entries_for_run(&self, run_id: Uuid) -> Result<Vec<TraceEntry>>;

    /// Exits of a run in recording order
    async fn exits_for_run(&self, run_id: Uuid) -> Result<Vec<TraceExit>>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>>;
}

/// In-memory trace store (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryTraceStore {
    entries: RwLock<Vec<TraceEntry>>,
    exits: RwLock<Vec<TraceExit>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TraceSink for InMemoryTraceStore {
    async fn add_entry(&self, entry: TraceEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn add_exit(&self, exit: TraceExit) -> Result<()> {
        self.exits.write().await.push(exit);
        Ok(())
    }
}

#[async_trait::async_trait]
impl TraceStore for InMemoryTraceStore {
    async fn entries_for_run(&self, run_id: Uuid) -> Result<Vec<TraceEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn exits_for_run(&self, run_id: Uuid) -> Result<Vec<TraceExit>> {
        let exits = self.exits.read().await;
        Ok(exits
            .iter()
            .filter(|exit| exit.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let entries = self.entries.read().await;
        let exits = self.exits.read().await;

        let mut runs: HashMap<Uuid, RunSummary> = HashMap::new();
        for entry in entries.iter() {
            let summary = runs.entry(entry.run_id).or_insert_with(|| RunSummary {
                run_id: entry.run_id,
                entries: 0,
                exits: 0,
                errors: 0,
                first_seen: entry.timestamp,
                last_seen: entry.timestamp,
            });
            summary.entries += 1;
            summary.first_seen = summary.first_seen.min(entry.timestamp);
            summary.last_seen = summary.last_seen.max(entry.timestamp);
        }
        for exit in exits.iter() {
            let summary = runs.entry(exit.run_id).or_insert_with(|| RunSummary {
                run_id: exit.run_id,
                entries: 0,
                exits: 0,
                errors: 0,
                first_seen: exit.timestamp,
                last_seen: exit.timestamp,
            });
            summary.exits += 1;
            if exit.is_error() {
                summary.errors += 1;
            }
            summary.first_seen = summary.first_seen.min(exit.timestamp);
            summary.last_seen = summary.last_seen.max(exit.timestamp);
        }

        let mut runs: Vec<RunSummary> = runs.into_values().collect();
        runs.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        runs.truncate(limit);
        Ok(runs)
    }
}
