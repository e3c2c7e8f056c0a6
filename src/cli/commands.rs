//! CLI command definitions for queuectl.
//!
//! Every command opens the shared database, performs one operation and exits,
//! except `worker start`, which runs a worker pool until it is stopped.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser};
use tracing::info;

use crate::config::{ConfigKey, QueueConfig};
use crate::metrics::{export_metrics, init_metrics, MetricsAggregator, MetricsCollector};
use crate::scheduler::{
    FileLogSink, Job, JobFilter, JobQueue, JobSpec, JobState, WorkerPool,
};
use crate::storage::Store;

/// Durable background job queue.
#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "Durable background job queue with retries and a dead letter queue")]
#[command(version)]
#[command(
    long_about = "queuectl runs shell commands as background jobs.\n\nJobs are stored in a SQLite database shared by every queuectl process; failed jobs are retried with exponential backoff and moved to the dead letter queue once their retries are exhausted.\n\nExample usage:\n  queuectl enqueue '{\"id\":\"job1\",\"command\":\"sleep 2\"}'\n  queuectl worker start --count 3\n  queuectl status"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database file (default: ~/.queuectl.db).
    #[arg(long, env = "QUEUECTL_DB", global = true)]
    pub db: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a job from JSON, a JSON file, or a command line.
    #[command(alias = "add")]
    Enqueue(EnqueueArgs),

    /// List jobs, optionally filtered by state.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show one job as JSON.
    Show(ShowArgs),

    /// Show job counts per state, active workers and DLQ size.
    Status,

    /// Inspect and manage the dead letter queue.
    Dlq(DlqArgs),

    /// Read and change retry and timeout settings.
    Config(ConfigArgs),

    /// Start or stop workers.
    Worker(WorkerArgs),

    /// Show job metrics.
    Metrics(MetricsArgs),
}

/// Arguments for `queuectl enqueue`.
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["job", "command", "file"])))]
pub struct EnqueueArgs {
    /// Job description as JSON, e.g. '{"command":"echo hi","priority":1}'.
    pub job: Option<String>,

    /// Shell command to run.
    #[arg(short, long)]
    pub command: Option<String>,

    /// File containing a JSON job description.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Job id (generated when omitted).
    #[arg(long)]
    pub id: Option<String>,

    /// Priority; lower values run first.
    #[arg(short, long)]
    pub priority: Option<i64>,

    /// Earliest start time (RFC 3339).
    #[arg(long)]
    pub run_at: Option<DateTime<Utc>>,

    /// Attempts before the job moves to the dead letter queue.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Exponential backoff base in seconds.
    #[arg(long)]
    pub base_backoff: Option<f64>,

    /// Execution timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Arguments for `queuectl list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only jobs in this state (pending, processing, completed, failed, dead).
    #[arg(short, long)]
    pub state: Option<JobState>,

    /// Maximum number of jobs to show.
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Print JSON instead of one line per job.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `queuectl show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Job id.
    pub id: String,
}

/// Arguments for `queuectl dlq`.
#[derive(Parser, Debug)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqSubcommand,
}

/// DLQ subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DlqSubcommand {
    /// List dead jobs.
    List,

    /// Move a dead job back to pending with a fresh retry budget.
    Retry {
        /// Job id.
        id: String,
    },

    /// Delete a dead job, or every dead job with --all.
    Purge {
        /// Job id.
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Delete every dead job.
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
}

/// Arguments for `queuectl config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

/// Config subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print the effective value of a key.
    Get {
        /// max_retries, base_backoff or job_timeout_sec.
        key: ConfigKey,
    },

    /// Set a key for all jobs claimed from now on.
    Set {
        /// max_retries, base_backoff or job_timeout_sec.
        key: ConfigKey,
        value: String,
    },

    /// Print every key with its effective value.
    List,
}

/// Arguments for `queuectl worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerSubcommand,
}

/// Worker subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum WorkerSubcommand {
    /// Run workers in the foreground until stopped (Ctrl-C or `worker stop`).
    Start {
        /// Number of concurrent workers.
        #[arg(short, long, env = "QUEUECTL_WORKERS")]
        count: Option<usize>,
    },

    /// Ask every running worker to stop after its current job.
    Stop,
}

/// Arguments for `queuectl metrics`.
#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// Completed/failed counts per minute over the last hour.
    #[arg(long, conflicts_with = "prometheus")]
    pub timeseries: bool,

    /// Prometheus text exposition format.
    #[arg(long)]
    pub prometheus: bool,
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
    let mut config = QueueConfig::from_env()?;
    if let Some(db) = cli.db {
        config = config.with_db_path(db);
    }

    let store = Store::open(&config.db_path).await?;
    let queue = JobQueue::new(store.clone()).with_stale_after(config.stale_after);

    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(&queue, args).await,
        Commands::List(args) => run_list_command(&queue, args).await,
        Commands::Show(args) => run_show_command(&queue, args).await,
        Commands::Status => print_json(&queue.status().await?),
        Commands::Dlq(args) => run_dlq_command(&queue, args).await,
        Commands::Config(args) => run_config_command(&queue, args).await,
        Commands::Worker(args) => run_worker_command(&queue, &config, args).await,
        Commands::Metrics(args) => run_metrics_command(store, args).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn print_job_line(job: &Job) {
    println!(
        "[{}] {} - {} (attempts: {})",
        job.state.as_str().to_uppercase(),
        job.id,
        job.command,
        job.attempts
    );
}

// ============================================================================
// Job Commands
// ============================================================================

async fn run_enqueue_command(queue: &JobQueue, args: EnqueueArgs) -> anyhow::Result<()> {
    let mut spec = if let Some(json) = args.job {
        JobSpec::from_json(&json)?
    } else if let Some(path) = args.file {
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        JobSpec::from_json(&json)?
    } else {
        JobSpec::new(args.command.unwrap_or_default())
    };

    // Flags override fields from JSON.
    if args.id.is_some() {
        spec.id = args.id;
    }
    if args.priority.is_some() {
        spec.priority = args.priority;
    }
    if args.run_at.is_some() {
        spec.run_at = args.run_at;
    }
    if args.max_retries.is_some() {
        spec.max_retries = args.max_retries;
    }
    if args.base_backoff.is_some() {
        spec.base_backoff = args.base_backoff;
    }
    if args.timeout.is_some() {
        spec.timeout_sec = args.timeout;
    }

    let job = queue.enqueue(spec).await?;
    println!("Enqueued job {}", job.id);
    Ok(())
}

async fn run_list_command(queue: &JobQueue, args: ListArgs) -> anyhow::Result<()> {
    let mut filter = JobFilter::new();
    if let Some(state) = args.state {
        filter = filter.with_state(state);
    }
    if let Some(limit) = args.limit {
        filter = filter.with_limit(limit);
    }

    let jobs = queue.list(&filter).await?;
    if args.json {
        return print_json(&jobs);
    }

    if jobs.is_empty() {
        println!("No jobs found");
    }
    for job in &jobs {
        print_job_line(job);
    }
    Ok(())
}

async fn run_show_command(queue: &JobQueue, args: ShowArgs) -> anyhow::Result<()> {
    match queue.get(&args.id).await? {
        Some(job) => print_json(&job),
        None => anyhow::bail!("Job '{}' not found", args.id),
    }
}

// ============================================================================
// Operator Commands
// ============================================================================

async fn run_dlq_command(queue: &JobQueue, args: DlqArgs) -> anyhow::Result<()> {
    match args.command {
        DlqSubcommand::List => {
            let jobs = queue.dlq().list().await?;
            if jobs.is_empty() {
                println!("Dead letter queue is empty");
            }
            for job in &jobs {
                print_job_line(job);
                if let Some(error) = &job.last_error {
                    println!("    last error: {}", error);
                }
            }
        }
        DlqSubcommand::Retry { id } => {
            let job = queue.dlq().retry(&id, Utc::now()).await?;
            println!("Job {} moved back to pending", job.id);
        }
        DlqSubcommand::Purge { id, all } => {
            let target = if all { None } else { id.as_deref() };
            let removed = queue.dlq().purge(target).await?;
            println!("Removed {} dead job(s)", removed);
        }
    }
    Ok(())
}

async fn run_config_command(queue: &JobQueue, args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigSubcommand::Get { key } => {
            println!("{}", queue.get_config(key).await?);
        }
        ConfigSubcommand::Set { key, value } => {
            let stored = queue.set_config(key, &value).await?;
            println!("{} = {}", key, stored);
        }
        ConfigSubcommand::List => {
            for entry in queue.config_entries().await? {
                let suffix = if entry.is_default { " (default)" } else { "" };
                println!("{} = {}{}", entry.key, entry.value, suffix);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Worker Commands
// ============================================================================

async fn run_worker_command(
    queue: &JobQueue,
    config: &QueueConfig,
    args: WorkerArgs,
) -> anyhow::Result<()> {
    match args.command {
        WorkerSubcommand::Start { count } => {
            let count = count.unwrap_or(config.workers);
            if count == 0 {
                anyhow::bail!("--count must be at least 1");
            }

            init_metrics()?;

            let log_sink = Arc::new(FileLogSink::new(&config.log_dir));
            let mut pool = WorkerPool::new(queue.store().clone(), config.pool_config(count), log_sink);
            pool.start().await?;
            println!(
                "Started {} worker(s), logs in {}. Press Ctrl-C or run `queuectl worker stop` to stop.",
                count,
                config.log_dir.display()
            );

            tokio::select! {
                result = pool.wait_for_stop() => result?,
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Received Ctrl-C, finishing in-flight jobs");
                    pool.shutdown().await?;
                }
            }

            let stats = pool.stats();
            println!(
                "Workers stopped after {} execution(s): {} completed, {} retried, {} dead ({:.1}% succeeded, avg {:.2}s)",
                stats.total_processed(),
                stats.jobs_completed,
                stats.jobs_retried,
                stats.jobs_dead,
                stats.success_rate(),
                stats.average_job_duration.as_secs_f64()
            );
        }
        WorkerSubcommand::Stop => {
            queue.request_stop().await?;
            println!("Stop requested; workers exit after their current job");
        }
    }
    Ok(())
}

// ============================================================================
// Metrics Commands
// ============================================================================

async fn run_metrics_command(store: Store, args: MetricsArgs) -> anyhow::Result<()> {
    let aggregator = MetricsAggregator::new(store);

    if args.timeseries {
        return print_json(&aggregator.timeseries(Utc::now()).await?);
    }

    let snapshot = aggregator.snapshot().await?;
    if args.prometheus {
        init_metrics()?;
        MetricsCollector::new().set_queue_depth(&snapshot.counts());
        print!("{}", export_metrics());
        return Ok(());
    }

    print_json(&snapshot)
}
