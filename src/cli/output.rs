//! CLI output formatting

use crate::{
    core::ExecutionStatus,
    execution::{ErrorKind, ExecutionEvent, TraceExit},
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Spinner shown while a run is in flight
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Format a run status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
        ExecutionStatus::Superseded => style("SUPERSEDED").yellow().to_string(),
        ExecutionStatus::Suspended => style("SUSPENDED").blue().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted { run_id, steps } => {
            let run = run_id
                .as_ref()
                .map(short_id)
                .unwrap_or_else(|| "untraced".to_string());
            format!(
                "{} Starting run {} ({} steps)",
                ROCKET,
                style(run).dim(),
                style(steps).cyan()
            )
        }
        ExecutionEvent::StepStarted {
            brick_id,
            label,
            depth,
            ..
        } => match label {
            Some(label) => format!(
                "{}{} {} {}",
                indent(*depth),
                SPINNER,
                style(label).cyan(),
                style(brick_id).dim()
            ),
            None => format!("{}{} {}", indent(*depth), SPINNER, style(brick_id).cyan()),
        },
        ExecutionEvent::StepSkipped { brick_id, depth, .. } => format!(
            "{}{} {} {}",
            indent(*depth),
            SKIP,
            style(brick_id).dim(),
            style("(guard is falsy)").dim()
        ),
        ExecutionEvent::StepCompleted {
            brick_id,
            output,
            depth,
            ..
        } => format!(
            "{}{} {} {}",
            indent(*depth),
            CHECK,
            style(brick_id).green(),
            style(format_output(&compact(output), 1)).dim()
        ),
        ExecutionEvent::StepFailed {
            brick_id,
            error,
            kind,
            depth,
            ..
        } => match kind {
            ErrorKind::Continuation => format!(
                "{}{} {} {}",
                indent(*depth),
                WARN,
                style(brick_id).yellow(),
                style("needs a display; suspended").dim()
            ),
            ErrorKind::Cancelled | ErrorKind::Superseded => format!(
                "{}{} {}: {}",
                indent(*depth),
                WARN,
                style(brick_id).yellow(),
                style(error).dim()
            ),
            _ => format!(
                "{}{} {}: {}",
                indent(*depth),
                CROSS,
                style(brick_id).red(),
                style(error).dim()
            ),
        },
        ExecutionEvent::RunFinished { status, .. } => {
            format!("{} Run finished: {}", INFO, format_status(*status))
        }
    }
}

/// Format a traced run for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let icon = if summary.errors > 0 { CROSS } else { CHECK };
    format!(
        "{} {} - {} - {} entries, {} exits, {} errors",
        icon,
        style(summary.run_id).bold(),
        style(summary.last_seen.to_rfc3339()).dim(),
        style(summary.entries).cyan(),
        style(summary.exits).cyan(),
        if summary.errors > 0 {
            style(summary.errors).red()
        } else {
            style(summary.errors).dim()
        }
    )
}

/// Format one trace exit for display
pub fn format_trace_exit(exit: &TraceExit) -> String {
    let branches: Vec<String> = exit
        .branches
        .iter()
        .map(|branch| format!("{}[{}]", branch.key, branch.counter))
        .collect();
    let at = if branches.is_empty() {
        String::new()
    } else {
        format!(" @ {}", branches.join("/"))
    };

    if let Some(error) = &exit.error {
        format!(
            "{}{} {}{}: {}",
            indent(exit.branches.len()),
            CROSS,
            style(&exit.brick_id).red(),
            style(at).dim(),
            style(error).dim()
        )
    } else if exit.skipped_run {
        format!(
            "{}{} {}{} {}",
            indent(exit.branches.len()),
            SKIP,
            style(&exit.brick_id).dim(),
            style(at).dim(),
            style("skipped").dim()
        )
    } else {
        let output = exit.output.as_ref().map(compact).unwrap_or_default();
        format!(
            "{}{} {}{} {}",
            indent(exit.branches.len()),
            CHECK,
            style(&exit.brick_id).green(),
            style(at).dim(),
            style(format_output(&output, 1)).dim()
        )
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
