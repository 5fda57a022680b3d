use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use task_coordinator::Coordinator;
use task_store::postgres::PgDocumentStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use task_orchestrator::{commands, config::Config, migrate, worker::Worker};

#[derive(Parser, Debug)]
#[command(name = "task-orchestrator")]
#[command(about = "Dispatch core for AI-agent coding tasks against per-app repositories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Document Store + Coordinator schema migrations.
    Migrate,

    /// Run the worker loop: claim tasks, run the agent subprocess, stream logs, finalize.
    Worker,

    /// Run the standalone lease-expiry reaper loop.
    CoordinatorReap,

    /// Create an app (a tenant: repository, database, bucket).
    AppCreate {
        #[arg(long)]
        name: String,
        #[arg(long)]
        db_name: String,
        #[arg(long)]
        db_user: String,
        #[arg(long)]
        db_password: String,
        #[arg(long)]
        bucket_name: String,
    },

    /// Create a task against an app, in status `authoring`.
    TaskCreate {
        #[arg(long)]
        app_id: Uuid,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
    },

    /// Transition a task to `in-progress` and enqueue it for dispatch.
    TaskStart {
        #[arg(long)]
        app_id: Uuid,
        #[arg(long)]
        task_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env().context("load orchestrator config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Worker => run_worker(cfg).await,
        Command::CoordinatorReap => run_reaper(cfg).await,
        Command::AppCreate {
            name,
            db_name,
            db_user,
            db_password,
            bucket_name,
        } => commands::create_app(&cfg, &name, &db_name, &db_user, &db_password, &bucket_name)
            .await
            .map(|_| ()),
        Command::TaskCreate {
            app_id,
            title,
            description,
        } => commands::create_task(&cfg, app_id, &title, &description)
            .await
            .map(|_| ()),
        Command::TaskStart { app_id, task_id } => commands::start_task(&cfg, app_id, task_id).await,
    }
}

async fn run_worker(cfg: Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections((cfg.worker_concurrency as u32) + 2)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;

    let store: Arc<dyn task_store::DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let coordinator = Coordinator::new(
        pool,
        Duration::from_secs(cfg.lease_ttl_secs),
        Duration::from_millis(cfg.worker_poll_ms),
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(event = "worker.shutdown.requested", "shutdown signal received");
        shutdown_signal.cancel();
    });

    Worker::new(cfg, store, coordinator).run(shutdown).await
}

async fn run_reaper(cfg: Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    task_coordinator::reaper::run(
        pool,
        Duration::from_millis(cfg.lease_reaper_poll_ms),
        shutdown,
    )
    .await;
    Ok(())
}
