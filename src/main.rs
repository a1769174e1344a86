#![allow(dead_code)]

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

mod error;
mod executor;
mod handler;
mod id;
mod metrics;
mod pg;
mod scheduler;
mod task;
mod worker;

use handler::{Handler, Registry};
use metrics::Metrics;
use scheduler::ScheduleEntry;
use task::Task;

#[derive(Debug, Clone, Parser)]
#[command(version, about, subcommand_required = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Runs worker and scheduler together against a disposable, locally
    /// managed Postgres instance. No DATABASE_URL required.
    Dev(DevOptions),
    /// Runs only the worker loop for one queue.
    Worker(WorkerCliOptions),
    /// Runs only the scheduler.
    Scheduler(SchedulerOptions),
    /// Applies pending SQL migrations and exits.
    Migrate(MigrationOptions),
}

#[derive(Debug, Clone, Parser)]
pub struct DevOptions {
    #[arg(long, env = "DATABASE_URL")]
    postgres_url: Option<String>,
    #[arg(long, default_value_t = true)]
    postgres_temporary: bool,
    #[arg(long, env = "QUEUE", default_value = "default")]
    queue: String,
    #[arg(long, env = "BATCH_SIZE", default_value_t = 10)]
    batch_size: i64,
    #[command(flatten)]
    executor: ExecutorOptions,
}

#[derive(Debug, Clone, Parser)]
pub struct WorkerCliOptions {
    #[arg(long, env = "DATABASE_URL")]
    postgres_url: String,
    #[arg(long, env = "QUEUE", default_value = "default")]
    queue: String,
    #[arg(long, env = "BATCH_SIZE", default_value_t = 10)]
    batch_size: i64,
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 5000)]
    poll_interval_ms: u64,
    #[command(flatten)]
    executor: ExecutorOptions,
}

#[derive(Debug, Clone, Parser)]
pub struct ExecutorOptions {
    #[arg(long, env = "MAX_THREADS", default_value_t = 256)]
    max_threads: usize,
}

#[derive(Debug, Clone, Parser)]
pub struct SchedulerOptions {
    #[arg(long, env = "DATABASE_URL")]
    postgres_url: String,
    #[command(flatten)]
    executor: ExecutorOptions,
}

#[derive(Debug, Clone, Parser)]
pub struct MigrationOptions {
    #[arg(long, env = "DATABASE_URL")]
    postgres_url: String,
}

/// Handler registration is an external concern (task-handler business logic
/// is out of scope); `noop` exists only so `dev`/`worker` have something to
/// dispatch out of the box and so the S1 happy-path scenario is observable
/// end to end without a caller supplying their own handlers.
struct NoopHandler;

#[async_trait::async_trait]
impl Handler for NoopHandler {
    async fn handle(&self, _task: &Task) -> Result<(), error::HandlerError> {
        Ok(())
    }
}

fn default_registry() -> Registry {
    Registry::new().register("noop", Arc::new(NoopHandler))
}

/// One illustrative cron entry, firing the same `noop` handler every minute.
fn default_schedule() -> Vec<ScheduleEntry> {
    vec![ScheduleEntry::new("heartbeat", "* * * * *", "noop")]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv_override();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dev(dev_options) => run_dev(dev_options).await?,
        Commands::Worker(worker_options) => run_worker(worker_options).await?,
        Commands::Scheduler(scheduler_options) => run_scheduler(scheduler_options).await?,
        Commands::Migrate(migrate_options) => {
            let pool = pg::create_pool(migrate_options.postgres_url).await?;
            pg::migrate_pg(&pool).await?;
        }
    }

    tracing::info!("program stopped");

    Ok(())
}

async fn resolve_dev_url(options: &DevOptions) -> anyhow::Result<String> {
    match &options.postgres_url {
        Some(url) if !url.is_empty() => Ok(url.clone()),
        _ => {
            let connection_url = pg::run_embedded(options.postgres_temporary).await?;
            let temp_pool = pg::create_pool(connection_url.clone()).await?;
            tracing::info!("migrating embedded database");
            pg::migrate_pg(&temp_pool).await?;
            Ok(connection_url)
        }
    }
}

async fn run_dev(options: DevOptions) -> anyhow::Result<()> {
    let postgres_url = resolve_dev_url(&options).await?;
    let pool = pg::create_pool(postgres_url).await?;

    let tasks = default_registry();
    let metrics = Arc::new(Metrics::new());
    let executor_config = executor::Config::from_cli(options.executor.clone()).await;
    let executor = Arc::new(executor::Executor::new(executor_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_config = worker::Config::new(
        "dev-worker",
        options.queue.clone(),
        pool.clone(),
        executor.clone(),
        tasks.clone(),
        metrics.clone(),
    )
    .batch_size(options.batch_size);
    let worker_handle = worker::spawn(worker_config);

    let scheduler_config = scheduler::Config {
        pool: pool.clone(),
        executor: executor.clone(),
        schedule: default_schedule(),
        tasks,
    };
    let scheduler_rx = shutdown_rx.clone();
    let scheduler_join = tokio::spawn(scheduler::start(scheduler_config, scheduler_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down dev services");
    let _ = shutdown_tx.send(true);

    worker_handle.shutdown().await?;
    scheduler_join.await??;
    executor.shutdown().await;

    Ok(())
}

async fn run_worker(options: WorkerCliOptions) -> anyhow::Result<()> {
    let pool = pg::create_pool(options.postgres_url).await?;
    let executor_config = executor::Config::from_cli(options.executor.clone()).await;
    let executor = Arc::new(executor::Executor::new(executor_config));
    let metrics = Arc::new(Metrics::new());

    let config = worker::Config::new(
        "worker",
        options.queue,
        pool,
        executor.clone(),
        default_registry(),
        metrics,
    )
    .batch_size(options.batch_size)
    .poll_interval(std::time::Duration::from_millis(options.poll_interval_ms));

    let handle = worker::spawn(config);

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down worker");
    handle.shutdown().await?;
    executor.shutdown().await;

    Ok(())
}

async fn run_scheduler(options: SchedulerOptions) -> anyhow::Result<()> {
    let pool = pg::create_pool(options.postgres_url.clone()).await?;
    let executor_config = executor::Config::from_cli(options.executor.clone()).await;
    let executor = Arc::new(executor::Executor::new(executor_config));

    let config = scheduler::Config::from_cli(
        options,
        pool,
        executor.clone(),
        default_schedule(),
        default_registry(),
    )
    .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(scheduler::start(config, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down scheduler");
    let _ = shutdown_tx.send(true);
    join.await??;
    executor.shutdown().await;

    Ok(())
}
