//! Coordinator: the dispatch broker.
//!
//! Holds per-app FIFO queues, an implicit "ready" set (an app is ready iff its queue is
//! non-empty and it holds no live lease — never materialized as its own table), per-app
//! exclusive leases with a TTL, and a reaper that recovers crashed work. Backed by Postgres
//! (`FOR UPDATE SKIP LOCKED` + an upsert-with-expiry-check for lease acquisition) in place of
//! a Redis-shaped broker, matching this codebase's existing substitution for message-broker
//! infrastructure in local/self-hosted deployments.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

pub mod reaper;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

#[derive(Debug, Clone, Copy)]
pub struct Claim {
    pub app_id: Uuid,
    pub task_id: Uuid,
    pub lease_token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Coordinator {
    pool: PgPool,
    lease_ttl: Duration,
    claim_poll_interval: Duration,
}

impl Coordinator {
    pub fn new(pool: PgPool, lease_ttl: Duration, claim_poll_interval: Duration) -> Self {
        Self {
            pool,
            lease_ttl,
            claim_poll_interval,
        }
    }

    /// Appends `task_id` to `queue[app_id]` with an increasing `order_key`, so it is served
    /// after everything already queued for this app — `claim` pops the smallest `order_key`
    /// first, giving FIFO order. Idempotence per task id is the caller's responsibility —
    /// double-enqueue double-runs.
    pub async fn enqueue(&self, app_id: Uuid, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue (app_id, task_id, order_key, enqueued_at)
            VALUES ($1, $2, nextval('queue_order_seq'), now())
            "#,
        )
        .bind(app_id)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("enqueue task")?;
        Ok(())
    }

    /// Blocks until some app is ready, acquiring its lease and popping the tail of its queue.
    pub async fn claim(&self) -> Result<Claim> {
        loop {
            if let Some(claim) = self.try_claim_once().await? {
                return Ok(claim);
            }
            tokio::time::sleep(self.claim_poll_interval).await;
        }
    }

    /// Acquires the lease, pops the queue tail, and records `processing_task_id` inside one
    /// transaction, mirroring `task-store/src/postgres.rs`'s `create_task`/`append_log` pattern
    /// — a process kill between any two of those three steps must not leave the task popped
    /// out of `queue` without being recorded under the lease, or it becomes invisible to both
    /// the queue and the reaper (`spec.md` §3 invariant 4).
    async fn try_claim_once(&self) -> Result<Option<Claim>> {
        let Some(app_id) = self.pick_candidate_app().await? else {
            return Ok(None);
        };

        let lease_token = Uuid::new_v4();
        let expires_at = Utc::now() + chrono::Duration::from_std(self.lease_ttl).unwrap();

        let mut tx = self.pool.begin().await.context("begin claim tx")?;

        let acquired: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO leases (app_id, lease_token, processing_task_id, expires_at)
            VALUES ($1, $2, NULL, $3)
            ON CONFLICT (app_id) DO UPDATE
              SET lease_token = EXCLUDED.lease_token,
                  processing_task_id = NULL,
                  expires_at = EXCLUDED.expires_at
              WHERE leases.expires_at <= now()
            RETURNING app_id
            "#,
        )
        .bind(app_id)
        .bind(lease_token)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await
        .context("acquire lease")?;

        if acquired.is_none() {
            // Lost the race (another worker won, or a stale lease never expired). Nothing was
            // written by the conditional upsert, but roll back explicitly rather than relying
            // on drop.
            tx.rollback().await.context("release tx after lost lease race")?;
            return Ok(None);
        }

        let popped: Option<Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM queue
            WHERE id = (
                SELECT id FROM queue
                WHERE app_id = $1
                ORDER BY order_key
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING task_id
            "#,
        )
        .bind(app_id)
        .fetch_optional(&mut *tx)
        .await
        .context("pop queue tail")?;

        let Some(task_id) = popped else {
            // Raced with another claimer that already drained this app's queue. Rolling back
            // the transaction undoes the lease acquire along with the no-op pop.
            tx.rollback().await.context("release lease after empty pop")?;
            return Ok(None);
        };

        sqlx::query("UPDATE leases SET processing_task_id = $1 WHERE app_id = $2 AND lease_token = $3")
            .bind(task_id)
            .bind(app_id)
            .bind(lease_token)
            .execute(&mut *tx)
            .await
            .context("record processing task")?;

        tx.commit().await.context("commit claim tx")?;

        tracing::info!(event = "coordinator.claim", %app_id, %task_id, "claimed task");

        Ok(Some(Claim {
            app_id,
            task_id,
            lease_token,
            expires_at,
        }))
    }

    async fn pick_candidate_app(&self) -> Result<Option<Uuid>> {
        let app_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT q.app_id
            FROM queue q
            WHERE NOT EXISTS (
                SELECT 1 FROM leases l
                WHERE l.app_id = q.app_id AND l.expires_at > now()
            )
            ORDER BY q.order_key
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("pick candidate app")?;
        Ok(app_id)
    }

    /// Resets `lease[app]` TTL. A no-op if the lease token no longer matches (already expired
    /// and reaped, or already released) — safe to call concurrently with completion.
    pub async fn renew(&self, app_id: Uuid, lease_token: Uuid) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::from_std(self.lease_ttl).unwrap();
        sqlx::query(
            r#"
            UPDATE leases
            SET expires_at = $1
            WHERE app_id = $2 AND lease_token = $3
            "#,
        )
        .bind(expires_at)
        .bind(app_id)
        .bind(lease_token)
        .execute(&self.pool)
        .await
        .context("renew lease")?;
        Ok(())
    }

    /// Deletes `processing[app]` and `lease[app]`. A no-op if no lease is held under this
    /// token; re-readiness for the next claim is implicit once the lease row is gone.
    pub async fn release(&self, app_id: Uuid, lease_token: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM leases WHERE app_id = $1 AND lease_token = $2")
            .bind(app_id)
            .bind(lease_token)
            .execute(&self.pool)
            .await
            .context("release lease")?;
        tracing::info!(event = "coordinator.release", %app_id, released = result.rows_affected() > 0, "released lease");
        Ok(())
    }
}
