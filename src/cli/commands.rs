//! CLI command definitions for medbatch.
//!
//! Every command builds its collaborators from [`EngineConfig`], with CLI
//! flags overriding the environment where they overlap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::{
    BatchOrchestrator, BatchRequest, BatchStatusReport, BatchSubmitter, EngineConfig, FileTask,
    RetryPolicy, SubmissionReceipt,
};
use crate::metrics::init_metrics;
use crate::pipeline::{ArtifactCipher, FilePipeline};
use crate::scheduler::{
    DistributedExecutor, FallbackConfig, FallbackWorker, InlineExecutor, JobQueue, WorkerPool,
    WorkerPoolConfig,
};
use crate::storage::{
    ArtifactSink, ArtifactStorage, BatchFileRecord, Database, MemoryProgressStore, ProgressStore,
};

/// Batch processing engine for medical image uploads.
#[derive(Parser)]
#[command(name = "medbatch")]
#[command(about = "Convert, anonymize and encrypt batches of medical images")]
#[command(version)]
#[command(
    long_about = "medbatch turns batches of uploaded images into de-identified, encrypted DICOM artifacts.\n\nBatches run on a Redis-backed worker pool, or on an in-process worker when the broker is unavailable.\n\nExample usage:\n  medbatch worker --workers 4\n  medbatch submit --owner alice scan1.jpg scan2.dcm"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a pool of workers consuming batch jobs from Redis.
    Worker(WorkerArgs),

    /// Submit files as one batch.
    Submit(SubmitArgs),

    /// Show the status of a batch.
    Status(StatusArgs),

    /// List the batches of an owner.
    Batches(BatchesArgs),

    /// Create or update the database schema.
    Migrate(DatabaseArgs),

    /// Show broker queue depths.
    #[command(name = "queue-stats")]
    QueueStats(BrokerArgs),

    /// Apply the result TTL to stored job results that have none.
    Cleanup(BrokerArgs),
}

/// Connection flags shared by commands that need the database.
#[derive(Parser, Debug, Clone)]
pub struct DatabaseArgs {
    /// PostgreSQL URL. Without one, batches are tracked in memory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

/// Connection flags shared by commands that need the broker.
#[derive(Parser, Debug, Clone)]
pub struct BrokerArgs {
    /// Redis URL of the broker.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Broker queue name.
    #[arg(long, env = "MEDBATCH_QUEUE_NAME")]
    pub queue: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `medbatch worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Number of workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Directory for encrypted artifacts.
    #[arg(long, env = "MEDBATCH_ARTIFACT_PATH")]
    pub artifact_path: Option<PathBuf>,

    /// Hex-encoded 32-byte artifact key. A random key is used when absent.
    #[arg(long, env = "MEDBATCH_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,
}

/// Arguments for `medbatch submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Files to submit, in processing order.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Owner recorded with the batch.
    #[arg(long)]
    pub owner: Option<String>,

    /// Batch id to use instead of a generated one.
    #[arg(long)]
    pub batch_id: Option<Uuid>,

    /// Skip the broker and run the batch in this process.
    #[arg(long)]
    pub inline: bool,

    #[command(flatten)]
    pub database: DatabaseArgs,

    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Directory for encrypted artifacts.
    #[arg(long, env = "MEDBATCH_ARTIFACT_PATH")]
    pub artifact_path: Option<PathBuf>,

    /// Hex-encoded 32-byte artifact key. A random key is used when absent.
    #[arg(long, env = "MEDBATCH_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,
}

/// Arguments for `medbatch status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Batch to look up.
    pub batch_id: Uuid,

    /// Also list the artifacts stored for the batch.
    #[arg(long)]
    pub files: bool,

    #[command(flatten)]
    pub database: DatabaseArgs,
}

/// Arguments for `medbatch batches`.
#[derive(Parser, Debug)]
pub struct BatchesArgs {
    /// Owner whose batches to list.
    #[arg(long)]
    pub owner: String,

    #[command(flatten)]
    pub database: DatabaseArgs,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("Invalid engine configuration")?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Batches(args) => run_batches_command(config, args).await,
        Commands::Migrate(args) => run_migrate_command(config, args).await,
        Commands::QueueStats(args) => run_queue_stats_command(config, args).await,
        Commands::Cleanup(args) => run_cleanup_command(config, args).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn apply_database_args(config: &mut EngineConfig, args: &DatabaseArgs) {
    if let Some(url) = &args.database_url {
        if !url.is_empty() {
            config.database_url = Some(url.clone());
        }
    }
}

fn apply_broker_args(config: &mut EngineConfig, args: &BrokerArgs) {
    if let Some(url) = &args.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(queue) = &args.queue {
        config.queue_name = queue.clone();
    }
}

async fn connect_database(config: &EngineConfig) -> anyhow::Result<Option<Arc<Database>>> {
    match &config.database_url {
        Some(url) => {
            let db = Database::connect(url)
                .await
                .context("Failed to connect to database")?;
            Ok(Some(Arc::new(db)))
        }
        None => Ok(None),
    }
}

async fn require_database(config: &EngineConfig) -> anyhow::Result<Arc<Database>> {
    connect_database(config)
        .await?
        .context("This command needs a database; set DATABASE_URL or --database-url")
}

fn load_cipher(key: Option<&str>) -> anyhow::Result<ArtifactCipher> {
    match key {
        Some(hex_key) => ArtifactCipher::from_hex(hex_key).context("Invalid encryption key"),
        None => {
            warn!("No encryption key configured; artifacts sealed with a key that dies with this process");
            Ok(ArtifactCipher::generate())
        }
    }
}

/// Collaborators every batch-running command needs.
struct Engine {
    progress: Arc<dyn ProgressStore>,
    orchestrator: Arc<BatchOrchestrator>,
}

impl Engine {
    async fn build(
        config: &EngineConfig,
        db: Option<Arc<Database>>,
        key: Option<&str>,
    ) -> anyhow::Result<Self> {
        let progress: Arc<dyn ProgressStore>;
        let sink: Arc<dyn ArtifactSink>;
        match db {
            Some(db) => {
                progress = db.clone();
                sink = Arc::new(ArtifactStorage::new(&config.artifact_path, db));
            }
            None => {
                warn!("No database configured; batch progress is kept in memory");
                progress = Arc::new(MemoryProgressStore::new());
                sink = Arc::new(ArtifactStorage::filesystem_only(&config.artifact_path));
            }
        }

        let mut pipeline = FilePipeline::new(load_cipher(key)?, sink);
        if let Some(dir) = &config.scratch_path {
            pipeline = pipeline.with_scratch_dir(dir);
        }
        let orchestrator = BatchOrchestrator::new(Arc::new(pipeline), Arc::clone(&progress))
            .with_retry_policy(RetryPolicy::with_max_file_retries(config.max_file_retries));

        Ok(Self {
            progress,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &BatchStatusReport) {
    println!("Batch:     {}", report.batch_id);
    println!("Status:    {}", report.status);
    println!(
        "Progress:  {}/{} ({:.2}%)",
        report.processed_files, report.total_files, report.progress_percentage
    );
    println!("Created:   {}", report.created_at.to_rfc3339());
    if let Some(updated) = report.updated_at {
        println!("Updated:   {}", updated.to_rfc3339());
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run_worker_command(mut config: EngineConfig, args: WorkerArgs) -> anyhow::Result<()> {
    apply_database_args(&mut config, &args.database);
    apply_broker_args(&mut config, &args.broker);
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if let Some(path) = args.artifact_path {
        config.artifact_path = path;
    }
    config.validate()?;

    // Submitters and workers only meet through the database.
    let db = require_database(&config).await?;

    init_metrics().context("Failed to initialize metrics")?;
    let engine = Engine::build(&config, Some(db), args.encryption_key.as_deref()).await?;

    let queue = JobQueue::connect(&config.redis_url, &config.queue_name)
        .await
        .context("Failed to connect to broker")?;
    let mut pool = WorkerPool::with_queue(
        WorkerPoolConfig::from_engine(&config),
        Arc::new(queue),
        engine.orchestrator,
    );

    pool.start().await?;
    info!(workers = config.num_workers, queue = %config.queue_name, "Waiting for batches, press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    pool.shutdown().await?;
    let stats = pool.stats();
    info!(
        completed = stats.batches_completed,
        failed = stats.batches_failed,
        rejected = stats.batches_rejected,
        rotated = stats.workers_rotated,
        "Worker pool stopped"
    );
    Ok(())
}

fn read_file_tasks(paths: &[PathBuf]) -> anyhow::Result<Vec<FileTask>> {
    paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(FileTask::from_bytes(file_name(path), &bytes))
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Serialize)]
struct SubmitOutput {
    receipt: SubmissionReceipt,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<BatchStatusReport>,
}

async fn run_submit_command(mut config: EngineConfig, args: SubmitArgs) -> anyhow::Result<()> {
    apply_database_args(&mut config, &args.database);
    apply_broker_args(&mut config, &args.broker);
    if let Some(path) = args.artifact_path {
        config.artifact_path = path;
    }
    config.validate()?;

    let files = read_file_tasks(&args.files)?;
    let db = connect_database(&config).await?;
    let has_database = db.is_some();
    let engine = Engine::build(&config, db, args.encryption_key.as_deref()).await?;

    let fallback = Arc::new(FallbackWorker::new(
        Arc::clone(&engine.orchestrator),
        FallbackConfig::from_engine(&config),
    ));
    let mut submitter = BatchSubmitter::new(
        config.max_batch_size,
        Arc::clone(&engine.progress),
        Arc::new(InlineExecutor::new(Arc::clone(&fallback))),
    );

    if !args.inline && !has_database {
        warn!("No database configured; remote workers could not see this batch, running it in process");
    }
    if use_distributed(args.inline, has_database) {
        match JobQueue::connect(&config.redis_url, &config.queue_name).await {
            Ok(queue) => {
                submitter = submitter.with_primary(Arc::new(DistributedExecutor::new(Arc::new(queue))));
            }
            Err(e) => warn!(error = %e, "Broker unavailable, batch will run in process"),
        }
    }

    let mut request = BatchRequest::new(args.owner, files);
    if let Some(batch_id) = args.batch_id {
        request = request.with_batch_id(batch_id);
    }
    let receipt = submitter.submit(request).await?;

    // An in-process batch dies with this process, so wait for it.
    let report = if fallback.is_running() {
        let report = wait_for_terminal(&submitter, receipt.batch_id).await?;
        fallback.stop().await;
        Some(report)
    } else {
        None
    };

    if args.broker.json {
        return print_json(&SubmitOutput { receipt, report });
    }

    println!("Submitted batch {} ({} files) to the {} backend", receipt.batch_id, receipt.total_files, receipt.backend);
    if let Some(report) = report {
        print_report(&report);
    }
    Ok(())
}

/// Whether a submission may go to the broker.
///
/// Remote workers read batch records from the shared database, so a batch
/// recorded only in this process's memory has to run here.
fn use_distributed(inline: bool, has_database: bool) -> bool {
    !inline && has_database
}

async fn wait_for_terminal(
    submitter: &BatchSubmitter,
    batch_id: Uuid,
) -> anyhow::Result<BatchStatusReport> {
    loop {
        let report = submitter.status(batch_id).await?;
        if report.status.is_terminal() {
            return Ok(report);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    #[serde(flatten)]
    report: BatchStatusReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<BatchFileRecord>>,
}

async fn run_status_command(mut config: EngineConfig, args: StatusArgs) -> anyhow::Result<()> {
    apply_database_args(&mut config, &args.database);
    let db = require_database(&config).await?;

    let batch = db.read(args.batch_id).await?;
    let files = if args.files {
        Some(db.files_for_batch(args.batch_id).await?)
    } else {
        None
    };

    print_json(&StatusOutput {
        report: BatchStatusReport::from(&batch),
        files,
    })
}

async fn run_batches_command(mut config: EngineConfig, args: BatchesArgs) -> anyhow::Result<()> {
    apply_database_args(&mut config, &args.database);
    let db = require_database(&config).await?;

    let reports: Vec<BatchStatusReport> = db
        .list_by_owner(&args.owner)
        .await?
        .iter()
        .map(BatchStatusReport::from)
        .collect();
    print_json(&reports)
}

async fn run_migrate_command(mut config: EngineConfig, args: DatabaseArgs) -> anyhow::Result<()> {
    apply_database_args(&mut config, &args);
    let db = require_database(&config).await?;

    let applied = db.run_migrations().await?;
    println!("Applied {} migration(s)", applied);
    Ok(())
}

async fn run_queue_stats_command(mut config: EngineConfig, args: BrokerArgs) -> anyhow::Result<()> {
    apply_broker_args(&mut config, &args);
    let queue = JobQueue::connect(&config.redis_url, &config.queue_name).await?;
    let stats = queue.stats().await?;

    if args.json {
        return print_json(&stats);
    }

    println!("Queue:        {}", stats.queue_name);
    println!("Pending:      {}", stats.pending_jobs);
    println!("Processing:   {}", stats.processing_jobs);
    println!("Dead letter:  {}", stats.dead_letter_jobs);
    Ok(())
}

async fn run_cleanup_command(mut config: EngineConfig, args: BrokerArgs) -> anyhow::Result<()> {
    apply_broker_args(&mut config, &args);
    let queue = JobQueue::connect(&config.redis_url, &config.queue_name).await?;
    let report = queue.cleanup_results(config.result_ttl).await?;

    if args.json {
        return print_json(&report);
    }

    println!(
        "Checked {} result key(s), applied expiry to {}",
        report.result_keys, report.expiry_applied
    );
    Ok(())
}
