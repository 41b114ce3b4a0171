use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codeloop::backend::{
    BackendKind, ExecutionBackend, HttpJobClient, LocalBackend, OrphanTracker, RemoteBackend, cancellation,
};
use codeloop::id::generate_session_id;
use codeloop::orchestrator::{
    ExitStatusAnalyzer, ITERATION_KEY, LAST_RESULT_KEY, LoopOrchestrator, SUMMARY_KEY, ScriptGenerator,
    TerminalReason,
};
use codeloop::registry::{ArtifactRegistry, ArtifactStatus, CodeRef};
use codeloop::state::{Scope, StateStore};
use codeloop::storage::JsonlStorage;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(config: &Config) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codeloop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("codeloop.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    // RUST_LOG wins over the configured level
    let default_level = config.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn open_storage(config: &Config) -> Result<Arc<JsonlStorage>> {
    let storage = JsonlStorage::new(&config.storage.dir)
        .context(format!("Failed to open storage at {}", config.storage.dir.display()))?;
    Ok(Arc::new(storage))
}

/// Build the configured backend. This is the only place backend identity matters.
fn build_backend(
    config: &Config,
    storage: Arc<JsonlStorage>,
    interpreter: Option<&str>,
) -> Result<Arc<dyn ExecutionBackend>> {
    match config.backend.kind {
        BackendKind::Local => {
            let mut local = config.local();
            if let Some(interpreter) = interpreter {
                local.interpreter = interpreter.to_string();
            }
            Ok(Arc::new(LocalBackend::new(local)))
        }
        BackendKind::Remote => {
            let client = HttpJobClient::new(&config.backend.remote.http).context("Failed to create job client")?;
            let orphans = Arc::new(OrphanTracker::new(storage));
            Ok(Arc::new(
                RemoteBackend::new(client, config.backend.remote.poll.clone()).with_orphan_sink(orphans),
            ))
        }
    }
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run {
            script,
            session,
            max_iterations,
            interpreter,
        } => {
            handle_run_command(
                script,
                session.as_deref(),
                *max_iterations,
                interpreter.as_deref(),
                config,
            )
            .await
        }
        Commands::Summary { session } => handle_summary_command(session, config),
        Commands::Artifacts { session } => handle_artifacts_command(session, config),
        Commands::Reconcile => handle_reconcile_command(config).await,
    }
}

async fn handle_run_command(
    script: &Path,
    session: Option<&str>,
    max_iterations: Option<u32>,
    interpreter: Option<&str>,
    config: &Config,
) -> Result<()> {
    let session_id = session.map(str::to_string).unwrap_or_else(generate_session_id);
    info!("Running {} in session {}", script.display(), session_id);

    // Remote jobs cannot see local paths, so ship the source
    let code = match config.backend.kind {
        BackendKind::Local => CodeRef::path(script),
        BackendKind::Remote => CodeRef::inline(
            fs::read_to_string(script).context(format!("Failed to read {}", script.display()))?,
        ),
    };

    let mut orchestrator_config = config.orchestrator();
    if let Some(max) = max_iterations {
        orchestrator_config.max_iterations = max;
    }

    let storage = open_storage(config)?;
    let registry = Arc::new(ArtifactRegistry::new(storage.clone()));
    let backend = build_backend(config, storage.clone(), interpreter)?;
    println!(
        "{} session {} ({} backend, max {} iterations)",
        "Starting".green(),
        session_id.bold(),
        backend.name(),
        orchestrator_config.max_iterations
    );

    let (handle, cancel) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let orchestrator = LoopOrchestrator::new(
        storage,
        registry,
        backend,
        Arc::new(ScriptGenerator::new(code)),
        Arc::new(ExitStatusAnalyzer::default()),
        orchestrator_config,
    )
    .with_cancellation(cancel);

    let report = orchestrator.run_session(&session_id).await?;
    for outcome in &report.iterations {
        let status = outcome
            .artifact_status
            .map(colorize_status)
            .unwrap_or_else(|| "-".dimmed().to_string());
        println!(
            "  [{}] {} {}",
            outcome.iteration,
            status,
            outcome.result_summary.as_deref().unwrap_or("")
        );
        if let Some(inconsistency) = &outcome.inconsistency {
            println!("      {} {}", "inconsistency:".yellow(), inconsistency);
        }
    }

    let reason = match &report.reason {
        TerminalReason::FatalError(_) => report.reason.to_string().red(),
        _ => report.reason.to_string().cyan(),
    };
    println!("{} {}", "Stopped:".green(), reason);
    if let Some(summary) = &report.summary {
        println!("{} {}", "Summary:".green(), summary);
    }
    Ok(())
}

fn handle_summary_command(session: &str, config: &Config) -> Result<()> {
    info!("Showing summary for session {}", session);
    let storage = open_storage(config)?;
    let state = StateStore::open(storage, session)?;

    let summary: Option<String> = state.get_as(SUMMARY_KEY, Scope::Durable)?;
    let last_result: Option<String> = state.get_as(LAST_RESULT_KEY, Scope::Durable)?;
    let iteration: Option<u32> = state.get_as(ITERATION_KEY, Scope::Durable)?;

    if summary.is_none() && iteration.is_none() {
        println!("{} {}", "No state for session:".yellow(), session);
        return Ok(());
    }
    println!("{} {}", "Session:".green(), session.bold());
    println!("  iterations:  {}", iteration.unwrap_or(0));
    println!("  last result: {}", last_result.as_deref().unwrap_or("-"));
    println!("  summary:     {}", summary.as_deref().unwrap_or("-"));
    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn colorize_status(status: ArtifactStatus) -> String {
    let text = status.to_string();
    match status {
        ArtifactStatus::Consumed => text.green().to_string(),
        ArtifactStatus::Failed => text.red().to_string(),
        _ => text.yellow().to_string(),
    }
}

fn handle_artifacts_command(session: &str, config: &Config) -> Result<()> {
    info!("Listing artifacts for session {}", session);
    let storage = open_storage(config)?;
    let registry = ArtifactRegistry::new(storage);
    let artifacts = registry.list_for_session(session)?;

    if artifacts.is_empty() {
        println!("{} {}", "No artifacts for session:".yellow(), session);
        return Ok(());
    }
    for artifact in artifacts {
        println!(
            "{:>3}  {}  {}  {}",
            artifact.iteration,
            colorize_status(artifact.status),
            format_ms(artifact.created_at),
            artifact.id.dimmed()
        );
        if let Some(reason) = &artifact.failure_reason {
            println!("       reason: {}", reason);
        }
        if let Some(result_ref) = &artifact.result_ref {
            println!("       result: {}", result_ref);
        }
    }
    Ok(())
}

async fn handle_reconcile_command(config: &Config) -> Result<()> {
    info!("Reconciling orphaned runs");
    let storage = open_storage(config)?;
    let tracker = OrphanTracker::new(storage);
    let client = HttpJobClient::new(&config.backend.remote.http).context("Failed to create job client")?;

    let report = tracker.reconcile(&client).await?;
    println!("{} {} orphaned runs", "Checked".green(), report.checked);
    for (run_id, status) in &report.resolved {
        println!("  {} {} ({})", "resolved".green(), run_id, status);
    }
    for run_id in &report.still_running {
        println!("  {} {}", "running".yellow(), run_id);
    }
    for (run_id, error) in &report.errors {
        println!("  {} {}: {}", "error".red(), run_id, error);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging once the configured level is known
    setup_logging(&config).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
