use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;

/// Runs the Document Store's and Coordinator's migrations against the single state database.
/// Both crates embed their own `migrations/` directory; there is no separate data database to
/// migrate, unlike the teacher's state/data split — this system has one store.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;

    sqlx::migrate!("../crates/task-store/migrations")
        .run(&pool)
        .await
        .context("migrate task-store schema")?;

    sqlx::migrate!("../crates/task-coordinator/migrations")
        .run(&pool)
        .await
        .context("migrate task-coordinator schema")?;

    tracing::info!(event = "orchestrator.migrate.complete", "migrations complete");
    Ok(())
}
