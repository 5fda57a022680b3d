//! The expiry-recovery path: a single long-lived loop that finds expired leases and pushes
//! their in-flight task back to the tail of the app's queue, ahead of newer arrivals.

use anyhow::Context;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

pub async fn run(pool: PgPool, poll_interval: Duration, shutdown: tokio_util::sync::CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(event = "coordinator.reaper.stopped", "lease reaper stopped");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {
                match reap_expired_leases_once(&pool).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(event = "coordinator.reaper.recovered", count = n, "recovered expired leases"),
                    Err(err) => tracing::warn!(event = "coordinator.reaper.error", error = %err, "lease reaper tick failed"),
                }
            }
        }
    }
}

pub async fn reap_expired_leases_once(pool: &PgPool) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await.context("begin reaper tx")?;

    let rows = sqlx::query(
        r#"
        SELECT app_id, processing_task_id
        FROM leases
        WHERE expires_at <= now() AND processing_task_id IS NOT NULL
        ORDER BY expires_at
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_all(&mut *tx)
    .await
    .context("select expired leases")?;

    let mut recovered = Vec::with_capacity(rows.len());
    for row in &rows {
        let app_id: Uuid = row.try_get("app_id")?;
        let task_id: Uuid = row.try_get("processing_task_id")?;
        recovered.push((app_id, task_id));
    }

    for (app_id, task_id) in &recovered {
        sqlx::query("DELETE FROM leases WHERE app_id = $1")
            .bind(app_id)
            .execute(&mut *tx)
            .await
            .context("delete expired lease")?;

        // `nextval(...) - 4611686018427387904` keeps every recovery key negative (so it sorts
        // ahead of any positive order_key from a normal enqueue) while still increasing with
        // each call, so multiple recoveries in one tick (ordered by expires_at above) keep
        // FIFO order relative to each other rather than reversing.
        sqlx::query(
            r#"
            INSERT INTO queue (app_id, task_id, order_key, enqueued_at)
            VALUES ($1, $2, nextval('queue_recovery_seq') - 4611686018427387904, now())
            "#,
        )
        .bind(app_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("requeue recovered task at tail")?;
    }

    tx.commit().await.context("commit reaper tx")?;
    Ok(recovered.len())
}
