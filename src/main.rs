// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conductor main entry point - one-shot runs, the task server and maintenance commands.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use conductor::config::{self, CliOptions, ResolvedConfig};
use conductor::eviction::{EvictionScheduler, SkipReason, SweepReport};
use conductor::lock::ConversationLock;
use conductor::orchestrator::{TaskOrchestrator, TaskOutcome, TaskRequest};
use conductor::providers::create_client;
use conductor::store::{SqliteStore, Store};
use conductor::telemetry::{init_telemetry, TelemetryConfig};
use conductor::workflow::{
    LogNotifier, Notifier, RunOutcome, RunStatus, StdoutNotifier, WorkflowDefinition,
    WorkflowRun,
};
use conductor::workspace::{GitCli, WorkflowType, WorkspaceProvider, WorktreeProvider};
use conductor::OrchestratorError;

/// Conductor version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Conductor - isolated workspaces and multi-step AI workflows.
#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about = "Run multi-step AI workflows in isolated git worktrees", long_about = None)]
struct Cli {
    /// Completion provider to use
    #[arg(short, long, env = "CONDUCTOR_PROVIDER")]
    provider: Option<String>,

    /// Model to use
    #[arg(short, long, env = "CONDUCTOR_MODEL")]
    model: Option<String>,

    /// Base URL for the completion API
    #[arg(long, env = "CONDUCTOR_BASE_URL")]
    base_url: Option<String>,

    /// Maximum live workspaces per codebase
    #[arg(long, env = "CONDUCTOR_MAX_WORKSPACES")]
    max_workspaces: Option<usize>,

    /// Days without activity before a workspace is stale
    #[arg(long, env = "CONDUCTOR_STALE_DAYS")]
    stale_days: Option<u32>,

    /// SQLite database path
    #[arg(long, env = "CONDUCTOR_DB")]
    db: Option<PathBuf>,

    /// Directory that holds all worktrees
    #[arg(long, env = "CONDUCTOR_WORKTREE_BASE")]
    worktree_base: Option<PathBuf>,

    /// Show debug output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for listing commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Subcommands for conductor.
#[derive(Subcommand)]
enum Commands {
    /// Run one workflow in an isolated workspace and exit
    Run {
        /// Codebase to cut the workspace from
        #[arg(short, long)]
        codebase: String,

        /// Conversation the run belongs to
        #[arg(long, default_value = "cli")]
        conversation: String,

        /// Kind of work (issue, pr, review, thread, task)
        #[arg(long = "type", default_value = "task")]
        workflow_type: WorkflowType,

        /// Issue number, PR number, thread id or task name
        #[arg(long)]
        id: String,

        /// Pull request number, for pr and review workflows
        #[arg(long)]
        pr: Option<u64>,

        /// Pull request head commit
        #[arg(long, requires = "pr")]
        pr_sha: Option<String>,

        /// Workflow name
        #[arg(long, default_value = "workflow")]
        name: String,

        /// Step command, repeatable. Prefix with `!` for a fresh context.
        #[arg(short, long = "step", required = true)]
        steps: Vec<String>,

        /// Message available to prompts as $ARGUMENTS
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },

    /// Read JSON task requests from stdin, one per line, and run them
    Serve,

    /// Remove stale and merged workspaces
    Sweep {
        /// Only sweep this codebase
        #[arg(short, long)]
        codebase: Option<String>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Fail workflow runs left running by an unclean shutdown
    Reconcile,

    /// Inspect and remove workspaces
    Workspaces {
        #[command(subcommand)]
        action: WorkspacesAction,
    },

    /// Inspect workflow runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Show the resolved configuration
    Config,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum WorkspacesAction {
    /// List live workspaces
    List {
        #[arg(short, long)]
        codebase: Option<String>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Remove a workspace and its branch
    Remove {
        /// Workspace id (its path)
        id: String,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recent runs
    List {
        #[arg(long)]
        conversation: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show one run with its events
    Show { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let serving = matches!(cli.command, Commands::Serve);
    let telemetry = if serving {
        TelemetryConfig::production().with_level(tracing::Level::INFO)
    } else {
        TelemetryConfig::for_verbosity(cli.verbose, cli.quiet)
    };
    let _telemetry = init_telemetry(&telemetry)?.with_report(cli.verbose);

    let cli_options = CliOptions {
        provider: cli.provider,
        model: cli.model,
        base_url: cli.base_url,
        max_workspaces: cli.max_workspaces,
        stale_days: cli.stale_days,
        database_path: cli.db,
        worktree_base: cli.worktree_base,
    };
    let workspace_root = std::env::current_dir()?;
    let config = config::load_config(&workspace_root, cli_options)?;

    match cli.command {
        Commands::Run {
            codebase,
            conversation,
            workflow_type,
            id,
            pr,
            pr_sha,
            name,
            steps,
            message,
        } => {
            let task = TaskRequest {
                conversation_id: conversation,
                codebase_id: codebase,
                workflow_type,
                workflow_id: id,
                pr_number: pr,
                pr_sha,
                workflow: WorkflowDefinition::from_commands(name, &steps[..]),
                message: message.join(" "),
            };
            run_once(&config, task).await
        }
        Commands::Serve => serve(&config).await,
        Commands::Sweep { codebase, format } => {
            let (_, scheduler) = open_scheduler(&config)?;
            let report = scheduler.sweep(codebase.as_deref()).await?;
            print_sweep(&report, format)
        }
        Commands::Reconcile => {
            let orchestrator = open_orchestrator(&config, Arc::new(StdoutNotifier))?;
            let report = orchestrator
                .coordinator()
                .reconcile_abandoned_runs(config.run_grace())
                .await?;
            println!(
                "{} reconciled {} run(s), skipped {}",
                "✓".green(),
                report.reconciled.len(),
                report.skipped
            );
            Ok(())
        }
        Commands::Workspaces { action } => handle_workspaces(&config, action).await,
        Commands::Runs { action } => handle_runs(&config, action).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Version => {
            println!("conductor {VERSION}");
            Ok(())
        }
    }
}

/// Store, provider and scheduler without a completion client.
fn open_scheduler(config: &ResolvedConfig) -> anyhow::Result<(Arc<dyn Store>, EvictionScheduler)> {
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open_at(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    let provider: Arc<dyn WorkspaceProvider> = Arc::new(WorktreeProvider::from_config(
        Arc::new(GitCli::new(config.git_timeout())),
        config,
    ));
    let scheduler =
        EvictionScheduler::from_config(store.clone(), provider, ConversationLock::new(), config);
    Ok((store, scheduler))
}

fn open_orchestrator(
    config: &ResolvedConfig,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<Arc<TaskOrchestrator>> {
    let client = create_client(config)?;
    let orchestrator = TaskOrchestrator::from_config(config, client, notifier)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(Arc::new(orchestrator))
}

async fn reconcile_on_startup(orchestrator: &TaskOrchestrator, config: &ResolvedConfig) {
    match orchestrator
        .coordinator()
        .reconcile_abandoned_runs(config.run_grace())
        .await
    {
        Ok(report) if !report.reconciled.is_empty() => {
            info!(count = report.reconciled.len(), "Reconciled abandoned runs")
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Startup reconciliation failed"),
    }
}

async fn run_once(config: &ResolvedConfig, task: TaskRequest) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config, Arc::new(StdoutNotifier))?;
    reconcile_on_startup(&orchestrator, config).await;

    match orchestrator.handle_task(task).await? {
        TaskOutcome::Ran { workspace, outcome } => {
            println!("{} {}", "workspace:".dimmed(), workspace.path.display());
            match outcome {
                RunOutcome::Completed { run } => {
                    println!("{} run {} completed", "✓".green(), run.id);
                    Ok(())
                }
                RunOutcome::Failed { run, class, message } => {
                    eprintln!("{} run {} failed ({class}): {message}", "✗".red(), run.id);
                    std::process::exit(1);
                }
                RunOutcome::Rejected { existing_run_id } => {
                    eprintln!(
                        "{} run {existing_run_id} is still active for this conversation",
                        "✗".yellow()
                    );
                    std::process::exit(2);
                }
            }
        }
        TaskOutcome::CapacityExhausted(decision) => {
            eprintln!(
                "{} workspace limit reached ({}/{})",
                "✗".yellow(),
                decision.active_count,
                decision.limit
            );
            std::process::exit(3);
        }
    }
}

/// JSON lines in, JSON lines out. Tasks for different conversations run
/// concurrently; tasks for the same conversation queue on its lock.
async fn serve(config: &ResolvedConfig) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config, Arc::new(LogNotifier))?;
    reconcile_on_startup(&orchestrator, config).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Arc::clone(orchestrator.eviction()).spawn_periodic(
        config.sweep_interval(),
        Some((Arc::clone(orchestrator.coordinator()), config.run_grace())),
        shutdown_rx,
    );
    info!(version = VERSION, "Serving tasks from stdin");

    let dispatcher = Arc::clone(&orchestrator);
    let peak = pump_tasks(BufReader::new(tokio::io::stdin()), interrupted(), move |task| {
        let conversation_id = task.conversation_id.clone();
        let handle = dispatcher.dispatch(task);
        async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(OrchestratorError::Panicked(e.to_string())),
            };
            println!("{}", outcome_json(&conversation_id, &result));
        }
    })
    .await?;
    info!(peak_in_flight = peak, "Input closed, all tasks finished");

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    Ok(())
}

/// Read JSON task lines until EOF or `shutdown`, handing each task to
/// `submit`. Finished tasks are reaped while reading and the rest are awaited
/// before returning. Returns the most tasks in flight at once.
async fn pump_tasks<R, S, F, Fut>(reader: R, shutdown: S, mut submit: F) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
    F: FnMut(TaskRequest) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::pin!(shutdown);
    let mut lines = reader.lines();
    let mut tasks = JoinSet::new();
    let mut peak = 0;
    loop {
        tokio::select! {
            biased;
            Some(done) = tasks.join_next() => log_reporter_exit(done),
            _ = &mut shutdown => {
                info!(running = tasks.len(), "Interrupted, waiting for running tasks");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TaskRequest>(&line) {
                    Ok(task) => {
                        tasks.spawn(submit(task));
                        peak = peak.max(tasks.len());
                    }
                    Err(e) => {
                        println!("{}", json!({ "status": "invalid", "error": e.to_string() }));
                    }
                }
            }
        }
    }

    while let Some(done) = tasks.join_next().await {
        log_reporter_exit(done);
    }
    Ok(peak)
}

/// Resolves on ctrl-c. Never resolves if the signal cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn log_reporter_exit(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        warn!(error = %e, "Task reporter ended abnormally");
    }
}

fn outcome_json(
    conversation_id: &str,
    result: &Result<TaskOutcome, OrchestratorError>,
) -> serde_json::Value {
    match result {
        Ok(TaskOutcome::Ran { workspace, outcome }) => match outcome {
            RunOutcome::Completed { run } => json!({
                "conversationId": conversation_id,
                "status": "completed",
                "runId": run.id,
                "workspace": workspace.id,
            }),
            RunOutcome::Failed { run, class, message } => json!({
                "conversationId": conversation_id,
                "status": "failed",
                "runId": run.id,
                "workspace": workspace.id,
                "errorClass": class.as_str(),
                "error": message,
            }),
            RunOutcome::Rejected { existing_run_id } => json!({
                "conversationId": conversation_id,
                "status": "rejected",
                "runId": existing_run_id,
            }),
        },
        Ok(TaskOutcome::CapacityExhausted(decision)) => json!({
            "conversationId": conversation_id,
            "status": "capacityExhausted",
            "capacity": decision,
        }),
        Err(e) => json!({
            "conversationId": conversation_id,
            "status": "error",
            "error": e.to_string(),
        }),
    }
}

fn print_sweep(report: &SweepReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            for id in &report.removed {
                println!("{} removed {id}", "✓".green());
            }
            for skipped in &report.skipped {
                let reason = match &skipped.reason {
                    SkipReason::InUse => "in use".to_string(),
                    SkipReason::UncommittedChanges => "uncommitted changes".to_string(),
                    SkipReason::Failed(e) => format!("failed: {e}"),
                };
                println!("{} kept {} ({reason})", "•".yellow(), skipped.workspace_id);
            }
            if report.removed.is_empty() && report.skipped.is_empty() {
                println!("{}", "Nothing to sweep".dimmed());
            }
        }
    }
    Ok(())
}

async fn handle_workspaces(config: &ResolvedConfig, action: WorkspacesAction) -> anyhow::Result<()> {
    let (store, scheduler) = open_scheduler(config)?;
    match action {
        WorkspacesAction::List { codebase, format } => {
            let workspaces = store.list_active_workspaces(codebase.as_deref()).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workspaces)?),
                OutputFormat::Text => {
                    if workspaces.is_empty() {
                        println!("{}", "No live workspaces".dimmed());
                    }
                    for ws in workspaces {
                        println!(
                            "{:<8} {:<12} {:<24} {}",
                            ws.status.to_string().bright_cyan(),
                            ws.codebase_id,
                            ws.branch_name.bright_white(),
                            ws.last_activity_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
                        );
                        println!("         {}", ws.id.dimmed());
                    }
                }
            }
        }
        WorkspacesAction::Remove { id } => match scheduler.remove_workspace(&id).await? {
            Some(report) => {
                println!("{} removed {id}", "✓".green());
                if let Some(e) = report.git_error {
                    println!("  {} {e}", "git:".dimmed());
                }
            }
            None => println!("{} {id} was already removed", "•".yellow()),
        },
    }
    Ok(())
}

async fn handle_runs(config: &ResolvedConfig, action: RunsAction) -> anyhow::Result<()> {
    let store = SqliteStore::open_at(&config.database_path)?;
    match action {
        RunsAction::List {
            conversation,
            limit,
            format,
        } => {
            let runs = store.list_runs(conversation.as_deref(), limit).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runs)?),
                OutputFormat::Text => {
                    if runs.is_empty() {
                        println!("{}", "No runs".dimmed());
                    }
                    for run in &runs {
                        print_run_line(run);
                    }
                }
            }
        }
        RunsAction::Show { id } => {
            let Some(run) = store.get_run(&id).await? else {
                anyhow::bail!("run not found: {id}");
            };
            print_run_line(&run);
            if let Some(error) = &run.error {
                println!("  {} {error}", "error:".red());
            }
            for event in store.list_run_events(&id).await? {
                println!(
                    "  {} [{}] {} {} {}",
                    event.created_at.format("%H:%M:%S").to_string().dimmed(),
                    event.step_index,
                    event.kind.as_str(),
                    event.command.bright_white(),
                    event.detail.unwrap_or_default().dimmed()
                );
            }
        }
    }
    Ok(())
}

fn print_run_line(run: &WorkflowRun) {
    let status = match run.status {
        RunStatus::Completed => run.status.as_str().green(),
        RunStatus::Failed => run.status.as_str().red(),
        RunStatus::Running => run.status.as_str().yellow(),
    };
    println!(
        "{} {:<10} {:<16} step {} {}",
        run.id,
        status,
        run.workflow_name.bright_white(),
        run.current_step_index,
        run.started_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
    );
}
