use anyhow::{Context, Result};
use brick_runtime::{
    bricks::{BrickRegistry, InMemoryBrickRegistry},
    cli::{
        commands::{BricksCommand, HistoryCommand, RunCommand, ValidateCommand},
        output::*,
        Cli, Command,
    },
    core::{PipelineDefinition, RunMetadata, RuntimeConfig},
    execution::{Continuation, ExecutionEngine, RunOutcome, TraceRecorder},
    logging,
    persistence::TraceStore,
    store::InMemoryStateStore,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[cfg(feature = "sqlite")]
type HistoryStore = brick_runtime::persistence::SqliteTraceStore;
#[cfg(not(feature = "sqlite"))]
type HistoryStore = brick_runtime::persistence::InMemoryTraceStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();
    logging::init(cli.verbose)?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
        Command::Bricks(cmd) => list_bricks(cmd)?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history(path: Option<&Path>) -> Result<Arc<HistoryStore>> {
    let store = match path {
        Some(path) => HistoryStore::new(path).await?,
        None => HistoryStore::with_default_path().await?,
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history(_path: Option<&Path>) -> Result<Arc<HistoryStore>> {
    Ok(Arc::new(HistoryStore::new()))
}

fn builtin_registry() -> Arc<InMemoryBrickRegistry> {
    Arc::new(InMemoryBrickRegistry::with_builtins(Arc::new(
        InMemoryStateStore::new(),
    )))
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let definition =
        PipelineDefinition::from_file(&cmd.file).context("Failed to load pipeline definition")?;
    let ctx = definition.context(cmd.parse_input()?);

    println!(
        "{} Loaded pipeline: {}",
        INFO,
        style(&definition.name).bold()
    );

    let registry = builtin_registry();
    let config = RuntimeConfig::new()
        .headless(cmd.headless)
        .strict_render(cmd.strict);

    let recorder = if cmd.no_trace {
        None
    } else {
        let store = open_history(cmd.trace_db.as_deref()).await?;
        Some(TraceRecorder::spawn(store))
    };

    let spinner = create_spinner(&definition.name);
    let printer = spinner.clone();
    let mut engine = ExecutionEngine::new(registry.clone())
        .with_config(config.clone())
        .with_event_handler(move |event| printer.println(format_execution_event(&event)));
    if let Some(recorder) = &recorder {
        engine = engine.with_recorder(recorder.clone());
    }

    let mut meta = if cmd.no_trace {
        RunMetadata::untraced()
    } else {
        RunMetadata::traced()
    };
    if let Some(mod_id) = &definition.mod_id {
        meta = meta.with_mod_id(mod_id);
    }
    let run_id = meta.run_id;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut outcome = engine
        .run_with_cancel(&definition.pipeline, ctx, meta, cancel.clone())
        .await;

    // The terminal can display what a headless run could not
    if let RunOutcome::Suspended(continuation) = &outcome {
        print_handoff(continuation);
        let mut display = ExecutionEngine::new(registry).with_config(config.headless(false));
        if let Some(recorder) = &recorder {
            display = display.with_recorder(recorder.clone());
        }
        outcome = display.resume_with_cancel(continuation, cancel).await;
    }

    engine.flush_traces().await;
    spinner.finish_and_clear();

    if let Some(run_id) = run_id {
        println!(
            "\n{} Trace saved (run ID: {})",
            INFO,
            style(run_id).dim()
        );
    }

    match outcome {
        RunOutcome::Completed(value) => {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&definition.name).bold(),
                style("successfully").green()
            );
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        other => {
            let status = other.status();
            println!(
                "\n{} {} {}",
                CROSS,
                style(&definition.name).bold(),
                format_status(status)
            );
            if let Some(e) = other.error() {
                error!("{}", e);
            }
            std::process::exit(1);
        }
    }
}

fn print_handoff(continuation: &Continuation) {
    println!(
        "{} {} cannot render headless; resuming with a display",
        WARN,
        style(continuation.step.display_name()).yellow()
    );
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => {
            let mut steps = 0;
            definition.pipeline.walk(&mut |_| steps += 1);

            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Name: {}", style(&definition.name).bold());
            println!("  Top-level steps: {}", style(definition.pipeline.len()).cyan());
            println!("  Steps including nested: {}", style(steps).cyan());
            if let Some(mod_id) = &definition.mod_id {
                println!("  Mod: {}", style(mod_id).cyan());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&definition)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history(cmd.trace_db.as_deref()).await?;

    if let Some(run_id) = cmd.parse_run_id()? {
        let entries = store.entries_for_run(run_id).await?;
        let exits = store.exits_for_run(run_id).await?;

        if entries.is_empty() && exits.is_empty() {
            println!("{} Run not found", WARN);
            return Ok(());
        }

        if cmd.json {
            let data = serde_json::json!({ "entries": entries, "exits": exits });
            println!("{}", serde_json::to_string_pretty(&data)?);
        } else {
            println!("{} Run {}", INFO, style(run_id).cyan());
            for exit in &exits {
                println!("  {}", format_trace_exit(exit));
            }
        }
        return Ok(());
    }

    let runs = store.list_runs(cmd.limit).await?;
    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

fn list_bricks(cmd: &BricksCommand) -> Result<()> {
    let registry = builtin_registry();
    let bricks: Vec<_> = registry
        .ids()
        .into_iter()
        .filter_map(|id| registry.get(&id))
        .collect();

    if cmd.json {
        let data: Vec<_> = bricks
            .iter()
            .map(|brick| {
                serde_json::json!({
                    "id": brick.id(),
                    "description": brick.description(),
                    "renderer": brick.is_renderer(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{} Builtin bricks:", INFO);
    for brick in &bricks {
        let renderer = if brick.is_renderer() { " (renderer)" } else { "" };
        println!(
            "  {}{} - {}",
            style(brick.id()).bold(),
            style(renderer).blue(),
            style(brick.description()).dim()
        );
    }
    Ok(())
}
