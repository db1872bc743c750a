//! CLI command definitions for review-forge.
//!
//! Every command loads [`OrchestratorConfig`] from the environment first;
//! flags given on the command line override the matching values.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::github::{CommentSink, DiffSource, GitHubClient};
use crate::llm::{ChatCompletionsClient, TextGenerator};
use crate::metrics;
use crate::pipeline::{CapabilityRegistry, PipelineRunner, StageExecutor};
use crate::ratelimit::{RateLimiter, ANTHROPIC_SERVICE, OPENAI_SERVICE};
use crate::scheduler::{Job, JobLifecycleManager, JobQueue, JobStatus, RedisJobQueue, WorkerPool};
use crate::storage::{JobStore, MigrationRunner, PgJobStore};

/// Multi-agent pull request review orchestrator.
#[derive(Parser)]
#[command(name = "review-forge")]
#[command(about = "Run multi-stage LLM reviews of pull requests from a durable job queue")]
#[command(version)]
#[command(
    long_about = "review-forge consumes pull request review jobs from a Redis queue, runs a \
    Scout -> Guardian/Architect/Stylist -> Synthesizer pipeline against the diff, and posts one \
    review comment per job.\n\nExample usage:\n  review-forge migrate\n  review-forge worker \
    --workers 8\n  review-forge submit --repo acme/api --pr 42"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Queue name (Redis key prefix).
    #[arg(long, env = "REVIEW_FORGE_QUEUE_NAME", global = true)]
    pub queue: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker pool until interrupted.
    Worker(WorkerArgs),

    /// Submit a review job for a pull request.
    Submit(SubmitArgs),

    /// List jobs in the dead letter queue.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// Re-enqueue a dead-lettered job with a fresh attempt budget.
    Replay(ReplayArgs),

    /// Print queue depth, job counts by status and metrics.
    Stats(StatsArgs),

    /// Apply database migrations.
    Migrate(MigrateArgs),
}

/// Arguments for `review-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers.
    #[arg(short = 'w', long, env = "REVIEW_FORGE_WORKERS")]
    pub workers: Option<usize>,

    /// Per-attempt timeout in seconds.
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,

    /// Per-stage timeout in seconds.
    #[arg(long)]
    pub stage_timeout_secs: Option<u64>,

    /// Apply pending migrations before starting.
    #[arg(long)]
    pub migrate: bool,
}

/// Arguments for `review-forge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Repository as `owner/name`.
    #[arg(short = 'r', long)]
    pub repo: String,

    /// Pull request number.
    #[arg(short = 'p', long)]
    pub pr: u64,

    /// Head commit of the pull request.
    #[arg(long)]
    pub head_sha: Option<String>,

    /// Pull request title, included in prompts.
    #[arg(long)]
    pub title: Option<String>,

    /// GitHub App installation id.
    #[arg(long)]
    pub installation_id: Option<u64>,

    /// Review this diff file instead of fetching the pull request diff.
    #[arg(long)]
    pub diff_file: Option<PathBuf>,

    /// Attempts before the job is dead-lettered.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `review-forge dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of entries to show, newest first.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `review-forge replay`.
#[derive(Parser, Debug)]
pub struct ReplayArgs {
    /// Id of the dead-lettered job.
    pub job_id: Uuid,

    /// Attempts granted to the replayed job.
    #[arg(long)]
    pub attempts: Option<u32>,
}

/// Arguments for `review-forge stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Append the Prometheus text exposition.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `review-forge migrate`.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// List applied migrations after running.
    #[arg(long)]
    pub list: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Worker(args) => run_worker_command(config, args).await?,
        Commands::Submit(args) => run_submit_command(config, args).await?,
        Commands::DeadLetters(args) => run_dead_letters_command(config, args).await?,
        Commands::Replay(args) => run_replay_command(config, args).await?,
        Commands::Stats(args) => run_stats_command(config, args).await?,
        Commands::Migrate(args) => run_migrate_command(config, args).await?,
    }
    Ok(())
}

/// Environment configuration with the global flags applied on top.
fn load_config(cli: &Cli) -> anyhow::Result<OrchestratorConfig> {
    // The database URL may come from the flag alone.
    let mut config = OrchestratorConfig::from_lookup(|key| match key {
        "DATABASE_URL" => cli.database_url.clone(),
        _ => std::env::var(key).ok(),
    })
    .context("Failed to load configuration")?;

    if let Some(url) = &cli.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(queue) = &cli.queue {
        config.queue_name = queue.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

// ============================================================================
// Wiring
// ============================================================================

/// Connected store, queue and lifecycle manager.
struct Runtime {
    store: Arc<PgJobStore>,
    queue: Arc<RedisJobQueue>,
    lifecycle: Arc<JobLifecycleManager>,
}

impl Runtime {
    /// Connects to Postgres and Redis and assembles the lifecycle manager.
    ///
    /// With `require_generators`, every service in the stage plan must have
    /// an API key; commands that never run the pipeline skip the check.
    async fn connect(
        config: &OrchestratorConfig,
        require_generators: bool,
    ) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;

        let store = Arc::new(
            PgJobStore::connect(&config.database_url)
                .await
                .context("Failed to connect to PostgreSQL")?,
        );
        let queue = Arc::new(
            RedisJobQueue::connect(&config.redis_url, &config.queue_name)
                .await
                .context("Failed to connect to Redis")?
                .with_lease(config.delivery_lease),
        );

        let limiter = Arc::new(RateLimiter::from_config(config)?);
        let capabilities = build_capabilities(config)?;
        let plan = config.stage_plan();
        if require_generators {
            for service in plan.services() {
                if capabilities.get(service).is_none() {
                    anyhow::bail!(
                        "No text generator for service '{}'. Set its API key.",
                        service
                    );
                }
            }
        }

        let executor =
            StageExecutor::new(Arc::clone(&limiter)).with_stage_timeout(config.stage_timeout);
        let runner = Arc::new(
            PipelineRunner::new(executor, plan, capabilities).with_diff_limits(config.diff_limits),
        );

        let github = Arc::new(
            GitHubClient::new(config.github_token.clone())
                .with_api_base(config.github_api_base.clone())
                .with_rate_limiter(limiter),
        );

        let lifecycle = Arc::new(
            JobLifecycleManager::new(
                Arc::clone(&store) as Arc<dyn JobStore>,
                Arc::clone(&queue) as Arc<dyn JobQueue>,
                runner,
                Arc::clone(&github) as Arc<dyn DiffSource>,
                github as Arc<dyn CommentSink>,
            )
            .with_backoff(config.backoff())
            .with_claim_lease(config.claim_lease)
            .with_job_timeout(config.job_timeout)
            .with_replay_attempts(config.replay_attempts)
            .with_stranded_after(config.stranded_after),
        );

        Ok(Self {
            store,
            queue,
            lifecycle,
        })
    }
}

/// Registers a chat-completions client for every backend with an API key.
fn build_capabilities(config: &OrchestratorConfig) -> anyhow::Result<CapabilityRegistry> {
    let mut capabilities = CapabilityRegistry::new();
    let backends = [
        (
            OPENAI_SERVICE,
            &config.openai_api_base,
            &config.openai_api_key,
        ),
        (
            ANTHROPIC_SERVICE,
            &config.anthropic_api_base,
            &config.anthropic_api_key,
        ),
    ];

    for (service, api_base, api_key) in backends {
        if api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            warn!(service, "No API key configured, stages on this service will fail");
            continue;
        }
        let client = ChatCompletionsClient::new(service, api_base.as_str(), api_key.clone())?
            .with_timeout(config.stage_timeout + Duration::from_secs(5));
        capabilities.register(Arc::new(client) as Arc<dyn TextGenerator>);
    }
    Ok(capabilities)
}

// ============================================================================
// Commands
// ============================================================================

async fn run_worker_command(
    mut config: OrchestratorConfig,
    args: WorkerArgs,
) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if let Some(secs) = args.job_timeout_secs {
        config.job_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.stage_timeout_secs {
        config.stage_timeout = Duration::from_secs(secs);
    }

    metrics::init_metrics().context("Failed to initialize metrics")?;
    let runtime = Runtime::connect(&config, true).await?;

    if args.migrate {
        let applied = runtime.store.run_migrations().await?;
        info!(applied, "Migrations applied");
    }

    let mut pool = WorkerPool::new(config.worker_pool_config(), Arc::clone(&runtime.lifecycle));
    pool.start().await?;
    info!(
        num_workers = config.num_workers,
        queue = %runtime.queue.queue_name(),
        "Waiting for review jobs (Ctrl+C to stop)"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let shutdown = pool.shutdown().await;
    let stats = pool.stats();
    info!(
        completed = stats.jobs_completed,
        retried = stats.jobs_retried,
        dead_lettered = stats.jobs_dead_lettered,
        skipped = stats.deliveries_skipped,
        errors = stats.errors,
        "Worker pool stopped"
    );
    shutdown?;
    Ok(())
}

async fn run_submit_command(config: OrchestratorConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let runtime = Runtime::connect(&config, false).await?;

    let mut job = Job::new(args.repo, args.pr)
        .with_max_attempts(args.max_attempts.unwrap_or(config.max_attempts));
    if let Some(path) = &args.diff_file {
        let diff = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read diff file {}", path.display()))?;
        job = job.with_inline_diff(diff);
    }
    if let Some(sha) = args.head_sha {
        job = job.with_head_sha(sha);
    }
    if let Some(title) = args.title {
        job = job.with_title(title);
    }
    if let Some(installation_id) = args.installation_id {
        job = job.with_installation_id(installation_id);
    }

    let job = runtime.lifecycle.submit(job).await?;

    if args.json {
        let output = serde_json::json!({
            "status": "queued",
            "job_id": job.id,
            "repository": job.repository,
            "pr_number": job.pr_number,
            "max_attempts": job.max_attempts,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Submitted job {} for {}#{}",
            job.id, job.repository, job.pr_number
        );
    }
    Ok(())
}

async fn run_dead_letters_command(
    config: OrchestratorConfig,
    args: DeadLettersArgs,
) -> anyhow::Result<()> {
    let queue = RedisJobQueue::connect(&config.redis_url, &config.queue_name)
        .await
        .context("Failed to connect to Redis")?;
    let entries = queue.peek_dead_letter(args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Dead letter queue is empty.");
        return Ok(());
    }

    println!("{} dead-lettered job(s):", entries.len());
    for entry in &entries {
        println!(
            "  {}  {}#{}  attempts {}/{}  at {}",
            entry.job.id,
            entry.job.repository,
            entry.job.pr_number,
            entry.job.attempts,
            entry.job.max_attempts,
            entry.moved_at.to_rfc3339()
        );
        println!("    {}", entry.error);
    }
    Ok(())
}

async fn run_replay_command(
    mut config: OrchestratorConfig,
    args: ReplayArgs,
) -> anyhow::Result<()> {
    if let Some(attempts) = args.attempts {
        config.replay_attempts = attempts;
    }
    let runtime = Runtime::connect(&config, false).await?;
    let job = runtime.lifecycle.replay_dead_letter(args.job_id).await?;

    println!(
        "Replayed job {} ({}#{}), attempts {}/{}",
        job.id, job.repository, job.pr_number, job.attempts, job.max_attempts
    );
    Ok(())
}

async fn run_stats_command(config: OrchestratorConfig, args: StatsArgs) -> anyhow::Result<()> {
    metrics::init_metrics().context("Failed to initialize metrics")?;

    let queue = RedisJobQueue::connect(&config.redis_url, &config.queue_name)
        .await
        .context("Failed to connect to Redis")?;
    let store = PgJobStore::connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let queue_stats = queue.stats().await?;
    metrics::set_queue_depth(&queue_stats);
    let counts = store.count_by_status().await?;
    let by_status: BTreeMap<&str, u64> = JobStatus::ALL
        .iter()
        .map(|status| (status.as_str(), counts.get(status).copied().unwrap_or(0)))
        .collect();

    if args.json {
        let output = serde_json::json!({
            "queue": {
                "name": queue_stats.queue_name,
                "pending": queue_stats.pending_jobs,
                "processing": queue_stats.processing_jobs,
                "delayed": queue_stats.delayed_jobs,
                "dead_letter": queue_stats.dead_letter_jobs,
            },
            "jobs": by_status,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Queue '{}':", queue_stats.queue_name);
        println!("  pending:     {}", queue_stats.pending_jobs);
        println!("  processing:  {}", queue_stats.processing_jobs);
        println!("  delayed:     {}", queue_stats.delayed_jobs);
        println!("  dead letter: {}", queue_stats.dead_letter_jobs);
        println!("Jobs by status:");
        for (status, count) in &by_status {
            println!("  {:<14} {}", status, count);
        }
    }

    if args.metrics {
        println!();
        print!("{}", metrics::export_metrics());
    }
    Ok(())
}

async fn run_migrate_command(config: OrchestratorConfig, args: MigrateArgs) -> anyhow::Result<()> {
    let store = PgJobStore::connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let applied = store.run_migrations().await?;
    println!("Applied {} migration(s).", applied);

    if args.list {
        let runner = MigrationRunner::new(store.pool().clone());
        for migration in runner.list_applied_migrations().await? {
            println!(
                "  {}  {}",
                migration.name,
                migration.applied_at.to_rfc3339()
            );
        }
    }
    Ok(())
}
