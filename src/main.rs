mod pipeline_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipewright_core::catalog;
use pipewright_core::config::AppConfig;
use pipewright_core::event::{EventBus, PipelineEvent};
use pipewright_core::run::{PipelineRun, RunStatus, TriggerDescriptor};
use pipewright_core::traits::RunLog;

use pipewright_engine::{Capabilities, CronScheduler, ExecutorRegistry, RunEngine};
use pipewright_remote::GatewayClient;

#[derive(Parser)]
#[command(name = "pipewright", version, about = "Run graph-defined automation pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "pipewright.toml", env = "PIPEWRIGHT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline once and print the result
    Run {
        /// Pipeline definition (.json or .toml)
        file: PathBuf,
        /// Start only this trigger node
        #[arg(long)]
        trigger: Option<String>,
        /// JSON payload delivered to the trigger node
        #[arg(long)]
        payload: Option<String>,
        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a pipeline definition without running it
    Validate {
        /// Pipeline definition (.json or .toml)
        file: PathBuf,
    },
    /// Show recent runs of a pipeline
    Runs {
        /// Pipeline id
        pipeline_id: String,
        /// Maximum number of runs to show
        #[arg(long, short = 'n', default_value = "10")]
        limit: usize,
        /// Print the run records as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the available node types
    Catalog {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
    /// Arm pipelines and fire their cron triggers until interrupted
    Schedule {
        /// Pipeline definitions (.json or .toml)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show current configuration
    Config,
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
        clap_complete::generate(*shell, &mut cmd, "pipewright", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if cli.config.exists() {
        info!(path = %cli.config.display(), "Config loaded");
    }

    match cli.command {
        Commands::Run {
            file,
            trigger,
            payload,
            json,
        } => run_pipeline(&config, &file, trigger, payload, json).await,
        Commands::Validate { file } => validate(&file),
        Commands::Runs {
            pipeline_id,
            limit,
            json,
        } => show_runs(&config, &pipeline_id, limit, json).await,
        Commands::Catalog { json } => show_catalog(json),
        Commands::Schedule { files } => schedule(&config, &files).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

/// Capabilities backed by the configured gateway, if any.
fn build_capabilities(config: &AppConfig) -> anyhow::Result<Capabilities> {
    let mut capabilities = Capabilities::new();
    match &config.gateway {
        Some(gateway) => {
            let client = Arc::new(GatewayClient::new(gateway)?);
            info!(endpoint = client.endpoint(), "Gateway configured");
            capabilities = capabilities
                .with_remote(client.clone())
                .with_isolated(client.clone())
                .with_system_events(client);
        }
        None => warn!("No [gateway] configured; remote node types will fail"),
    }
    Ok(capabilities)
}

fn build_engine(config: &AppConfig, events: Arc<EventBus>) -> anyhow::Result<RunEngine> {
    let run_log = pipewright_store::open(&config.run_log).context("Failed to open run log")?;
    Ok(
        RunEngine::new(ExecutorRegistry::with_builtins(), build_capabilities(config)?)
            .with_events(events)
            .with_run_log(run_log)
            .with_config(config.engine.clone()),
    )
}

async fn run_pipeline(
    config: &AppConfig,
    file: &Path,
    trigger: Option<String>,
    payload: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let pipeline = Arc::new(pipeline_file::load(file)?);

    let mut descriptor = TriggerDescriptor::manual();
    if let Some(node_id) = trigger {
        descriptor = descriptor.with_node(node_id);
    }
    if let Some(raw) = payload {
        let value = serde_json::from_str(&raw).context("--payload is not valid JSON")?;
        descriptor = descriptor.with_payload(value);
    }

    let events = Arc::new(EventBus::new(config.engine.event_capacity));
    let progress = tokio::spawn(print_progress(events.clone()));
    let engine = Arc::new(build_engine(config, events)?);

    let handle = engine.spawn(pipeline.clone(), descriptor);
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling run...");
            cancel.cancel();
        }
    });

    let report = handle.wait().await?;
    drop(engine);
    progress.abort();

    let base = file.parent().unwrap_or_else(|| Path::new("."));
    for path in pipeline_file::write_file_outputs(&pipeline, &report.run, base)? {
        eprintln!("Wrote {}", path.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report.run)?);
    } else {
        print_summary(&report.run);
    }

    match report.run.status {
        RunStatus::Success => Ok(()),
        status => bail!(
            "Run {} {}: {}",
            report.run.short_id(),
            status,
            report.run.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

async fn print_progress(events: Arc<EventBus>) {
    let mut rx = events.subscribe();
    while let Ok(event) = rx.recv().await {
        match event {
            PipelineEvent::NodeStarted {
                node_id, attempt, ..
            } if attempt > 1 => eprintln!("[{node_id}] retry {attempt}"),
            PipelineEvent::NodeCompleted {
                node_id,
                output_handle,
                duration_ms,
                ..
            } => match output_handle {
                Some(handle) => eprintln!("[{node_id}: ok -> {handle}] {duration_ms}ms"),
                None => eprintln!("[{node_id}: ok] {duration_ms}ms"),
            },
            PipelineEvent::NodeFailed { node_id, error, .. } => {
                eprintln!("[{node_id}: FAILED] {error}")
            }
            PipelineEvent::NodeSkipped {
                node_id, reason, ..
            } => eprintln!("[{node_id}: skipped] {}", reason.unwrap_or_default()),
            _ => {}
        }
    }
}

fn print_summary(run: &PipelineRun) {
    println!("Run {} ({})", run.id, run.status);
    for result in &run.node_results {
        let mut line = format!(
            "  {:<20} {:<10} {:>6}ms",
            result.node_id,
            format!("{:?}", result.status).to_lowercase(),
            result.duration_ms
        );
        if let Some(handle) = &result.output_handle {
            line.push_str(&format!("  -> {handle}"));
        }
        if let Some(i) = result.iteration {
            line.push_str(&format!("  (iteration {i})"));
        }
        if let Some(error) = &result.error {
            line.push_str(&format!("  {error}"));
        }
        println!("{line}");
    }
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let pipeline = pipeline_file::load(file)?;
    pipeline.validate()?;

    let registry = ExecutorRegistry::with_builtins();
    for node in &pipeline.nodes {
        let native = node.is_trigger() || node.node_type() == "loop";
        if !native && !registry.contains(node.node_type()) {
            bail!("Node '{}' has no executor for type '{}'", node.id, node.node_type());
        }
    }

    let triggers = pipeline.trigger_nodes().count();
    println!(
        "{} ({}): {} nodes, {} edges, {} triggers. OK",
        pipeline.id,
        pipeline.name,
        pipeline.nodes.len(),
        pipeline.edges.len(),
        triggers
    );
    Ok(())
}

async fn show_runs(
    config: &AppConfig,
    pipeline_id: &str,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let run_log: Arc<dyn RunLog> = pipewright_store::open(&config.run_log)?;
    let runs = run_log.load_recent(pipeline_id, Some(limit)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs recorded for '{pipeline_id}'.");
        return Ok(());
    }
    for run in &runs {
        println!(
            "{}  {:<10} {:<8} {}  {} nodes{}",
            run.short_id(),
            run.status.to_string(),
            run.trigger.kind,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.node_results.len(),
            run.error
                .as_deref()
                .map(|e| format!("  {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn show_catalog(json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(catalog::all())?);
        return Ok(());
    }
    for entry in catalog::all() {
        println!(
            "  {:<12} {:<11} {}",
            entry.id,
            entry.category.to_string(),
            entry.description
        );
    }
    Ok(())
}

async fn schedule(config: &AppConfig, files: &[PathBuf]) -> anyhow::Result<()> {
    let mut pipelines = Vec::new();
    for file in files {
        let mut pipeline = pipeline_file::load(file)?;
        pipeline.validate()?;
        pipeline.arm()?;
        pipelines.push(Arc::new(pipeline));
    }

    let events = Arc::new(EventBus::new(config.engine.event_capacity));
    let engine = Arc::new(build_engine(config, events)?);
    let cancel = CancellationToken::new();
    let scheduler = CronScheduler::new(&pipelines, engine, cancel.clone());
    if scheduler.job_count() == 0 {
        bail!("None of the given pipelines has a valid cron trigger");
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping scheduler");
            shutdown.cancel();
        }
    });

    scheduler.run().await;
    Ok(())
}
