//! CLI command definitions for persona-forge.
//!
//! `run` trains and deploys an adapter for one subject, `resume` picks up
//! interrupted runs, and `status`, `list` and `catalog` inspect state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{PromptCatalog, PromptLane};
use crate::metrics::{export_metrics, init_metrics};
use crate::models::{ImageCounts, PipelineRun, RunStatus, SubjectInput, ValidationResult};
use crate::pipeline::{
    PipelineConfig, PipelineOrchestrator, PipelineServices, ResumeOutcome, Resumer,
};
use crate::scheduler::RunScheduler;
use crate::storage::{
    BlobStorage, HttpBlobStorage, LocalBlobStorage, SqliteStatusStore, StatusStore,
};

/// Persona adapter forge.
#[derive(Parser)]
#[command(name = "persona-forge")]
#[command(about = "Build, validate and deploy character identity adapters from a reference image")]
#[command(version)]
#[command(
    long_about = "persona-forge turns one approved reference image into a deployed identity adapter.\n\nIt generates a training set, screens it with a vision model, captions it, trains an adapter, validates the result and deploys it.\n\nExample usage:\n  persona-forge run --subject-id 42 --name \"Ava Stone\" --gender woman --reference https://cdn.example/ava.png"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database path or URL.
    #[arg(long, env = "PERSONA_DATABASE_URL", global = true)]
    pub database: Option<String>,

    /// Root directory for local blob storage (ignored when STORAGE_URL is set).
    #[arg(long, env = "PERSONA_BLOB_ROOT", global = true)]
    pub blob_root: Option<PathBuf>,

    /// YAML prompt catalog. Defaults to the built-in catalog.
    #[arg(long, env = "PERSONA_CATALOG_PATH", global = true)]
    pub catalog: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the full pipeline for a subject and wait for it to finish.
    Run(RunArgs),

    /// Resume one interrupted run, or every stalled run.
    Resume(ResumeArgs),

    /// Show one run with its image counts and validation results.
    Status(StatusArgs),

    /// List runs in creation order.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Print or check the prompt catalog.
    Catalog(CatalogArgs),

    /// Register a consumer that should follow a subject's deployed adapter.
    Consumer(ConsumerArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// External id of the subject.
    #[arg(long)]
    pub subject_id: String,

    /// Display name of the subject.
    #[arg(long)]
    pub name: String,

    /// Leading caption tag (woman, man, person).
    #[arg(long, default_value = "person")]
    pub gender: String,

    /// URL or blob path of the approved reference image.
    #[arg(long)]
    pub reference: String,

    /// Short appearance description substituted into prompts.
    #[arg(long)]
    pub description: Option<String>,

    /// Override the slug derived from the name.
    #[arg(long)]
    pub slug: Option<String>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub print_metrics: bool,

    /// Output JSON instead of log lines.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Run to resume.
    #[arg(required_unless_present = "stalled")]
    pub run_id: Option<Uuid>,

    /// Resume every non-terminal run idle for longer than --stale-minutes.
    #[arg(long, conflicts_with = "run_id")]
    pub stalled: bool,

    /// Staleness window for --stalled.
    #[arg(long)]
    pub stale_minutes: Option<u64>,

    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    pub run_id: Uuid,

    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only runs with this status (e.g. training, deployed).
    #[arg(short, long)]
    pub status: Option<RunStatus>,

    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct CatalogArgs {
    /// Only prompts of this lane (primary, secondary).
    #[arg(long)]
    pub lane: Option<PromptLane>,

    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ConsumerArgs {
    /// Consumer id (e.g. a site or character slot).
    #[arg(long)]
    pub id: String,

    /// Subject whose deployed adapter the consumer uses.
    #[arg(long)]
    pub subject_id: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, args).await,
        Commands::Resume(args) => run_resume_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::List(args) => run_list_command(config, args).await,
        Commands::Catalog(args) => run_catalog_command(config, args),
        Commands::Consumer(args) => run_consumer_command(config, args).await,
    }
}

/// Environment first, then global flags on top.
fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env().context("invalid PERSONA_* configuration")?;
    if let Some(database) = &cli.database {
        config = config.with_database_url(database.clone());
    }
    if let Some(root) = &cli.blob_root {
        config = config.with_blob_root(root.clone());
    }
    if let Some(catalog) = &cli.catalog {
        config = config.with_catalog_path(catalog.clone());
    }
    config.validate()?;
    Ok(config)
}

fn load_catalog(config: &PipelineConfig) -> anyhow::Result<PromptCatalog> {
    match &config.catalog_path {
        Some(path) => PromptCatalog::load_file(path)
            .with_context(|| format!("failed to load catalog {}", path.display())),
        None => Ok(PromptCatalog::builtin()),
    }
}

fn build_blob_storage(config: &PipelineConfig) -> anyhow::Result<Arc<dyn BlobStorage>> {
    if std::env::var("STORAGE_URL").is_ok() {
        info!("Using HTTP object storage");
        return Ok(Arc::new(HttpBlobStorage::from_env()?));
    }

    let storage = match &config.blob_base_url {
        Some(base_url) => LocalBlobStorage::new(&config.blob_root, base_url.clone()),
        None => LocalBlobStorage::with_file_urls(&config.blob_root),
    };
    info!(root = %config.blob_root.display(), "Using local blob storage");
    Ok(Arc::new(storage))
}

async fn open_store(config: &PipelineConfig) -> anyhow::Result<Arc<SqliteStatusStore>> {
    let store = SqliteStatusStore::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    Ok(Arc::new(store))
}

async fn build_orchestrator(config: PipelineConfig) -> anyhow::Result<Arc<PipelineOrchestrator>> {
    let store = open_store(&config).await?;
    let blob = build_blob_storage(&config)?;
    let catalog = Arc::new(load_catalog(&config)?);
    let services = PipelineServices::from_env()?;

    Ok(Arc::new(PipelineOrchestrator::new(
        config, store, blob, catalog, services,
    )?))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// run
// ============================================================================

#[derive(Debug, Serialize)]
struct RunOutput {
    run_id: Uuid,
    status: RunStatus,
    error: Option<String>,
    adapter_url: Option<String>,
    validation_score: Option<f64>,
}

async fn run_pipeline_command(config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    init_metrics().context("failed to register metrics")?;

    let mut subject = SubjectInput::new(args.subject_id, args.name, args.gender, args.reference);
    if let Some(slug) = args.slug {
        subject = subject.with_slug(slug);
    }
    if let Some(description) = args.description {
        subject = subject.with_description(description);
    }
    if subject.slug.is_empty() {
        anyhow::bail!("subject name produces an empty slug; pass --slug");
    }

    let orchestrator = build_orchestrator(config).await?;
    let scheduler = RunScheduler::new(orchestrator.clone());
    let handle = scheduler.submit(subject).await?;
    let run_id = handle.run_id();
    info!(run_id = %run_id, "Run accepted");

    let status = handle.wait().await?;
    let run = orchestrator.store().get_run(run_id).await?;

    let output = RunOutput {
        run_id,
        status,
        error: run.error_message.clone(),
        adapter_url: run.artifact.as_ref().map(|a| a.url.clone()),
        validation_score: run.validation_score,
    };
    if args.json {
        print_json(&output)?;
    } else {
        println!("Run {} finished: {}", run_id, status);
        if let Some(url) = &output.adapter_url {
            println!("  adapter: {}", url);
        }
        if let Some(error) = &output.error {
            println!("  error: {}", error);
        }
    }

    if args.print_metrics {
        println!("{}", export_metrics());
    }

    if status == RunStatus::Failed {
        anyhow::bail!("run {} failed", run_id);
    }
    Ok(())
}

// ============================================================================
// resume
// ============================================================================

#[derive(Debug, Serialize)]
struct ResumeEntry {
    run_id: Uuid,
    outcome: String,
    status: Option<RunStatus>,
    error: Option<String>,
}

fn describe_outcome(run_id: Uuid, outcome: Result<ResumeOutcome, String>) -> ResumeEntry {
    match outcome {
        Ok(ResumeOutcome::Terminal(status)) => ResumeEntry {
            run_id,
            outcome: "already_finished".to_string(),
            status: Some(status),
            error: None,
        },
        Ok(ResumeOutcome::Resumed { entry, status }) => ResumeEntry {
            run_id,
            outcome: format!("resumed:{:?}", entry),
            status: Some(status),
            error: None,
        },
        Ok(ResumeOutcome::Abandoned { reason }) => ResumeEntry {
            run_id,
            outcome: "abandoned".to_string(),
            status: Some(RunStatus::Failed),
            error: Some(reason),
        },
        Err(error) => ResumeEntry {
            run_id,
            outcome: "error".to_string(),
            status: None,
            error: Some(error),
        },
    }
}

async fn run_resume_command(config: PipelineConfig, args: ResumeArgs) -> anyhow::Result<()> {
    init_metrics().context("failed to register metrics")?;

    let orchestrator = build_orchestrator(config).await?;
    let mut resumer = Resumer::new(orchestrator);
    if let Some(minutes) = args.stale_minutes {
        resumer = resumer.with_stale_after(Duration::from_secs(minutes * 60));
    }

    let entries: Vec<ResumeEntry> = match args.run_id {
        Some(run_id) => {
            let outcome = resumer.resume_run(run_id).await?;
            vec![describe_outcome(run_id, Ok(outcome))]
        }
        None => resumer
            .resume_stalled()
            .await?
            .into_iter()
            .map(|(run_id, outcome)| describe_outcome(run_id, outcome.map_err(|e| e.to_string())))
            .collect(),
    };

    if args.json {
        print_json(&entries)?;
    } else if entries.is_empty() {
        println!("No stalled runs");
    } else {
        for entry in &entries {
            let status = entry.status.map(|s| s.to_string()).unwrap_or_default();
            println!("{}  {:<28} {}", entry.run_id, entry.outcome, status);
            if let Some(error) = &entry.error {
                println!("    {}", error);
            }
        }
    }
    Ok(())
}

// ============================================================================
// status / list
// ============================================================================

#[derive(Debug, Serialize)]
struct StatusOutput {
    run: PipelineRun,
    images: ImageCounts,
    validations: Vec<ValidationResult>,
}

async fn run_status_command(config: PipelineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let run = store.get_run(args.run_id).await?;
    let images = store.image_counts(args.run_id).await?;
    let validations = store.list_validations(args.run_id).await?;

    if args.json {
        return print_json(&StatusOutput {
            run,
            images,
            validations,
        });
    }

    println!("Run        {}", run.id);
    println!("Subject    {} ({})", run.subject.name, run.subject.subject_id);
    println!("Status     {}", run.status);
    println!(
        "Images     {} total, {} passed, {} failed, {} replaced, {} pending, {} captioned",
        images.total, images.passed, images.failed, images.replaced, images.pending, images.captioned
    );
    println!("Training   {} attempt(s)", run.training_attempts);
    if let Some(job_id) = &run.training_job_id {
        println!("Job        {}", job_id);
    }
    for validation in &validations {
        println!(
            "Validation attempt {}: {}/{} passed, mean {:.2}{}",
            validation.attempt,
            validation.pass_count,
            validation.results.len(),
            validation.mean_score,
            if validation.overall_pass { " (pass)" } else { "" }
        );
    }
    if let Some(artifact) = &run.artifact {
        println!("Adapter    {} ({} bytes)", artifact.url, artifact.size_bytes);
    }
    if let Some(error) = &run.error_message {
        println!("Error      {}", error);
    }
    Ok(())
}

async fn run_list_command(config: PipelineConfig, args: ListArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let runs = store.list_runs(args.status).await?;

    if args.json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }
    for run in &runs {
        println!(
            "{}  {:<20} {:<18} {}",
            run.id,
            run.subject.slug,
            run.status,
            run.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

// ============================================================================
// catalog / consumer
// ============================================================================

fn run_catalog_command(config: PipelineConfig, args: CatalogArgs) -> anyhow::Result<()> {
    let catalog = load_catalog(&config)?;
    let prompts: Vec<_> = catalog
        .prompts()
        .iter()
        .filter(|p| args.lane.map_or(true, |lane| p.lane == lane))
        .collect();

    if args.json {
        return print_json(&prompts);
    }
    for prompt in &prompts {
        println!(
            "{:<28} {:<10} {:<11} {}",
            prompt.id, prompt.lane, prompt.category, prompt.text
        );
    }
    println!("{} prompts", prompts.len());
    Ok(())
}

async fn run_consumer_command(config: PipelineConfig, args: ConsumerArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    store.register_consumer(&args.id, &args.subject_id).await?;

    // Point the new consumer at the current deployment straight away.
    let deployed = store
        .list_runs(Some(RunStatus::Deployed))
        .await?
        .into_iter()
        .find(|run| run.subject.subject_id == args.subject_id);
    if let Some(run) = deployed {
        if let Some(artifact) = &run.artifact {
            store
                .link_active_adapter(&args.subject_id, run.id, &artifact.url)
                .await?;
        }
    }

    println!("Consumer {} follows subject {}", args.id, args.subject_id);
    Ok(())
}
