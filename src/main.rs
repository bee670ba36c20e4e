mod executors;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weaver_core::config::AppConfig;
use weaver_core::event::EventBus;
use weaver_core::traits::WorkflowStore;
use weaver_core::types::WorkflowDef;
use weaver_engine::{Engine, RunLogger, RunSummary, RunnerConfig, WorkflowRunner};
use weaver_store::SqliteStore;

#[derive(Parser)]
#[command(name = "weaver", version, about = "DAG workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weaver.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file and print its execution order
    Validate {
        /// Workflow definition (JSON)
        file: PathBuf,
    },
    /// Show the execution order and the first ready batch
    Plan {
        /// Workflow definition (JSON)
        file: PathBuf,
    },
    /// Run a workflow with the built-in executors
    Run {
        /// Workflow definition (JSON)
        file: PathBuf,
        /// Maximum nodes running at once
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Overall deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored executions of a workflow
    History {
        workflow_id: String,
        /// Maximum entries to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weaver", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Plan { file } => plan(&file),
        Commands::Run {
            file,
            max_concurrency,
            timeout,
            json,
        } => run(&config, &file, max_concurrency, timeout, json).await,
        Commands::History { workflow_id, limit } => history(&config, &workflow_id, limit).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Explicit config paths must exist; the default one may be absent.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return AppConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    if path != Path::new("weaver.toml") {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    Ok(AppConfig::default())
}

fn read_workflow(path: &Path) -> anyhow::Result<WorkflowDef> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    let mut workflow = WorkflowDef::from_json(&content)
        .with_context(|| format!("parsing workflow {}", path.display()))?;
    if workflow.id.is_empty() {
        workflow.id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
    }
    Ok(workflow)
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let workflow = read_workflow(file)?;
    let execution = weaver_engine::build_workflow(&workflow)?;
    println!(
        "Workflow '{}' is valid: {} nodes, {} edges",
        workflow.id,
        execution.node_count(),
        workflow.edges.len()
    );
    println!("Order: {}", execution.execution_order().join(" -> "));
    Ok(())
}

fn plan(file: &Path) -> anyhow::Result<()> {
    let workflow = read_workflow(file)?;
    // Throwaway engine: starting the execution computes its real first batch
    let engine = Engine::new(Arc::new(EventBus::default()));
    let execution = engine.create(&workflow)?;
    engine.start(execution.id())?;
    let first = engine
        .get(execution.id())
        .map(|started| started.current_batch().join(", "))
        .unwrap_or_default();

    println!("Execution order for '{}':", workflow.id);
    for (i, id) in execution.execution_order().iter().enumerate() {
        let deps = execution.dependency_ids(id);
        let node_type = execution.node(id).map(|n| n.node_type.as_str()).unwrap_or("?");
        if deps.is_empty() {
            println!("  {:>3}. {} [{}]", i + 1, id, node_type);
        } else {
            println!("  {:>3}. {} [{}] <- {}", i + 1, id, node_type, deps.join(", "));
        }
    }

    println!("First batch: {}", first);
    Ok(())
}

async fn run(
    config: &AppConfig,
    file: &Path,
    max_concurrency: Option<usize>,
    timeout: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let workflow = read_workflow(file)?;

    let mut runner_config = RunnerConfig::from(config);
    if let Some(n) = max_concurrency {
        runner_config.max_concurrency = n.max(1);
    }
    if let Some(secs) = timeout {
        runner_config.timeout = Duration::from_secs(secs);
    }

    let event_bus = Arc::new(EventBus::default());
    let engine = Arc::new(Engine::new(event_bus.clone()));
    let executors = Arc::new(executors::builtin_registry());
    let cancel = CancellationToken::new();

    let mut runner = WorkflowRunner::new(engine.clone(), executors, runner_config)
        .with_cancellation(cancel.clone());
    if let Some(path) = config.store_path() {
        let store: Arc<dyn WorkflowStore> = Arc::new(SqliteStore::open(&path)?);
        runner = runner.with_store(store);
    }

    // Ctrl-C cancels the run
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    // Build before running so the run logger can attach to the execution id
    let execution = engine.create(&workflow)?;
    let id = execution.id().clone();
    info!(execution_id = %id, workflow_id = %workflow.id, "Running workflow");

    let logger = config.run_log_dir().map(|dir| {
        tokio::spawn(RunLogger::new(dir).run(event_bus.clone(), id.clone(), cancel.child_token()))
    });

    let result = runner.run_execution(&id).await;
    if let Some(handle) = logger {
        handle.await.ok();
    }
    let summary = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&engine, &summary);
    }

    if !summary.succeeded() {
        anyhow::bail!("execution {} finished with status {}", summary.execution_id, summary.status);
    }
    Ok(())
}

fn print_summary(engine: &Engine, summary: &RunSummary) {
    if let Some(execution) = engine.get(&summary.execution_id) {
        for node in execution.nodes() {
            let elapsed = node
                .elapsed_ms()
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_default();
            match &node.error {
                Some(err) => println!("  {:<20} {:<10} {:>8}  {}", node.id, node.status, elapsed, err),
                None => println!("  {:<20} {:<10} {:>8}", node.id, node.status, elapsed),
            }
        }
    }

    println!(
        "\n{} {}: {} completed, {} failed, {} skipped of {} ({}ms)",
        summary.execution_id,
        summary.status,
        summary.completed_nodes,
        summary.failed_nodes,
        summary.skipped_nodes,
        summary.total_nodes,
        summary.duration_ms.unwrap_or(0)
    );
    for (node, output) in &summary.outputs {
        println!("  output {}: {}", node, output);
    }
}

async fn history(config: &AppConfig, workflow_id: &str, limit: usize) -> anyhow::Result<()> {
    let Some(path) = config.store_path() else {
        anyhow::bail!("No [store] configured; set store.path in the config file");
    };
    let store = SqliteStore::open(&path)?;
    let records = store.list_executions(workflow_id).await?;

    if records.is_empty() {
        println!("No stored executions for '{}'", workflow_id);
        return Ok(());
    }

    for record in records.iter().take(limit) {
        let duration = record
            .finished_at
            .map(|end| format!("{}ms", (end - record.started_at).num_milliseconds().max(0)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<10} {}  {}",
            record.execution_id,
            record.status,
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            duration
        );
    }
    Ok(())
}
