//! CLI command definitions

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

/// Run a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the pipeline YAML or JSON file
    #[arg(short, long)]
    pub file: String,

    /// JSON value bound to `@input`, replacing the definition's input
    #[arg(long)]
    pub input: Option<String>,

    /// Treat the host as unable to display renderer output
    #[arg(long)]
    pub headless: bool,

    /// Fail on missing variables instead of dropping them
    #[arg(long)]
    pub strict: bool,

    /// Don't record traces
    #[arg(long)]
    pub no_trace: bool,

    /// Trace database (defaults to the user data directory)
    #[arg(long)]
    pub trace_db: Option<PathBuf>,
}

impl RunCommand {
    pub fn parse_input(&self) -> Result<Option<Value>> {
        self.input
            .as_deref()
            .map(|text| serde_json::from_str(text).context("--input must be valid JSON"))
            .transpose()
    }
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the pipeline YAML or JSON file
    #[arg(short, long)]
    pub file: String,

    /// Print the normalised definition as JSON
    #[arg(long)]
    pub json: bool,
}

/// Show recorded run traces
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Show the trace of one run
    #[arg(long)]
    pub run_id: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Trace database (defaults to the user data directory)
    #[arg(long)]
    pub trace_db: Option<PathBuf>,
}

impl HistoryCommand {
    pub fn parse_run_id(&self) -> Result<Option<Uuid>> {
        self.run_id
            .as_deref()
            .map(|id| Uuid::parse_str(id).context("Invalid run ID format"))
            .transpose()
    }
}

/// List the builtin bricks
#[derive(Debug, Args, Clone)]
pub struct BricksCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
