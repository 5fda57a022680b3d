//! CLI-exposed store/coordinator operations, standing in for the HTTP CRUD surface that
//! `spec.md` marks out of scope — enough to create apps and tasks and exercise the dispatch
//! core end to end without a separate service.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use task_coordinator::Coordinator;
use task_store::{postgres::PgDocumentStore, DocumentStore, TaskStatus};
use uuid::Uuid;

use crate::config::Config;

pub(crate) async fn connect_store(cfg: &Config) -> anyhow::Result<PgDocumentStore> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;
    Ok(PgDocumentStore::new(pool))
}

pub(crate) async fn connect_coordinator(cfg: &Config) -> anyhow::Result<Coordinator> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;
    Ok(Coordinator::new(
        pool,
        Duration::from_secs(cfg.lease_ttl_secs),
        Duration::from_millis(cfg.worker_poll_ms),
    ))
}

pub async fn create_app(
    cfg: &Config,
    name: &str,
    db_name: &str,
    db_user: &str,
    db_password: &str,
    bucket_name: &str,
) -> anyhow::Result<Uuid> {
    let store = connect_store(cfg).await?;
    let app = store
        .create_app(name, db_name, db_user, db_password, bucket_name)
        .await
        .context("create app")?;
    println!("app_id={}", app.id);
    Ok(app.id)
}

pub async fn create_task(
    cfg: &Config,
    app_id: Uuid,
    title: &str,
    description: &str,
) -> anyhow::Result<Uuid> {
    let store = connect_store(cfg).await?;
    let task = store
        .create_task(app_id, title, description)
        .await
        .context("create task")?;
    println!("task_id={}", task.id);
    Ok(task.id)
}

/// Transitions a task from `authoring` to `in-progress` and enqueues it. The only place a
/// task is ever enqueued — creation alone never does (see `spec.md` §9).
pub async fn start_task(cfg: &Config, app_id: Uuid, task_id: Uuid) -> anyhow::Result<()> {
    let store = connect_store(cfg).await?;
    let task = store.get_task(task_id).await.context("load task")?;
    store
        .update_task(app_id, task_id, &task.title, &task.description, TaskStatus::InProgress)
        .await
        .context("mark task in-progress")?;

    let coordinator = connect_coordinator(cfg).await?;
    coordinator.enqueue(app_id, task_id).await.context("enqueue task")?;
    tracing::info!(event = "orchestrator.task.started", %app_id, %task_id, "task enqueued");
    Ok(())
}
