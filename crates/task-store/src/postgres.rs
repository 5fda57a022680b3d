use crate::{App, AppStatus, DocumentStore, Error, LogDocument, LogMessage, LogStream, Result, Task, TaskStatus};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures_like::stream_from_receiver;
use sqlx::{postgres::PgListener, PgPool, Row};
use uuid::Uuid;

mod futures_like {
    use super::*;
    use tokio::sync::mpsc::Receiver;
    use tokio_stream::wrappers::ReceiverStream;

    pub fn stream_from_receiver(rx: Receiver<Result<LogDocument>>) -> LogStream {
        Box::pin(ReceiverStream::new(rx))
    }
}

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_app(row: &sqlx::postgres::PgRow) -> Result<App> {
        let status: String = row.try_get("status")?;
        Ok(App {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: if status == "active" {
                AppStatus::Active
            } else {
                return Err(Error::msg(format!("unknown app status {status}")));
            },
            created_at: row.try_get("created_at")?,
            db_name: row.try_get("db_name")?,
            db_user: row.try_get("db_user")?,
            db_password: row.try_get("db_password")?,
            bucket_name: row.try_get("bucket_name")?,
        })
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task> {
        let status: String = row.try_get("status")?;
        let status = TaskStatus::parse(&status)
            .ok_or_else(|| Error::msg(format!("unknown task status {status}")))?;
        Ok(Task {
            id: row.try_get("id")?,
            app_id: row.try_get("app_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status,
            succeeded: row.try_get("succeeded")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn fetch_log_document(&self, task_id: Uuid) -> Result<LogDocument> {
        let doc_id: Uuid = sqlx::query_scalar("SELECT id FROM log_documents WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("fetch log document for task {task_id}"))?;

        let rows = sqlx::query(
            r#"
            SELECT time, title, text
            FROM log_messages
            WHERE task_id = $1
            ORDER BY seq
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch log messages")?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(LogMessage {
                time: row.try_get("time")?,
                title: row.try_get("title")?,
                text: row.try_get("text")?,
            });
        }

        Ok(LogDocument {
            id: doc_id,
            task_id,
            messages,
        })
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn create_app(
        &self,
        name: &str,
        db_name: &str,
        db_user: &str,
        db_password: &str,
        bucket_name: &str,
    ) -> Result<App> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO apps (id, name, status, created_at, db_name, db_user, db_password, bucket_name)
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(created_at)
        .bind(db_name)
        .bind(db_user)
        .bind(db_password)
        .bind(bucket_name)
        .execute(&self.pool)
        .await
        .context("insert app")?;

        Ok(App {
            id,
            name: name.to_string(),
            status: AppStatus::Active,
            created_at,
            db_name: db_name.to_string(),
            db_user: db_user.to_string(),
            db_password: db_password.to_string(),
            bucket_name: bucket_name.to_string(),
        })
    }

    async fn get_app(&self, app_id: Uuid) -> Result<App> {
        let row = sqlx::query("SELECT * FROM apps WHERE id = $1")
            .bind(app_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("fetch app {app_id}"))?;
        Self::row_to_app(&row)
    }

    async fn create_task(&self, app_id: Uuid, title: &str, description: &str) -> Result<Task> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await.context("begin create_task tx")?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, app_id, title, description, status, created_at)
            VALUES ($1, $2, $3, $4, 'authoring', $5)
            "#,
        )
        .bind(id)
        .bind(app_id)
        .bind(title)
        .bind(description)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("insert task")?;

        sqlx::query("INSERT INTO log_documents (id, task_id) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("insert log document")?;

        tx.commit().await.context("commit create_task tx")?;

        Ok(Task {
            id,
            app_id,
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Authoring,
            succeeded: None,
            created_at,
        })
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("fetch task {task_id}"))?;
        Self::row_to_task(&row)
    }

    async fn update_task(
        &self,
        app_id: Uuid,
        task_id: Uuid,
        title: &str,
        description: &str,
        status: TaskStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET title = $1, description = $2, status = $3
            WHERE id = $4 AND app_id = $5
            "#,
        )
        .bind(title)
        .bind(description)
        .bind(status.as_str())
        .bind(task_id)
        .bind(app_id)
        .execute(&self.pool)
        .await
        .context("update task")?;
        Ok(())
    }

    async fn mark_completed(&self, task_id: Uuid, succeeded: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', succeeded = $1
            WHERE id = $2
            "#,
        )
        .bind(succeeded)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("mark task completed")?;
        Ok(())
    }

    async fn append_log(&self, task_id: Uuid, messages: Vec<LogMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("begin append_log tx")?;
        let next_seq: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM log_messages WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await
        .context("compute next seq")?;

        for (offset, message) in messages.into_iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO log_messages (task_id, seq, time, title, text)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(task_id)
            .bind(next_seq + offset as i32)
            .bind(message.time)
            .bind(message.title)
            .bind(message.text)
            .execute(&mut *tx)
            .await
            .context("insert log message")?;
        }

        tx.commit().await.context("commit append_log tx")?;
        Ok(())
    }

    async fn get_log(&self, task_id: Uuid) -> Result<LogDocument> {
        self.fetch_log_document(task_id).await
    }

    async fn subscribe_logs(
        &self,
        task_id: Uuid,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<LogStream> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("connect log listener")?;
        listener
            .listen("log_document_changed")
            .await
            .context("listen log_document_changed")?;

        let store = self.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(32);

        // Deliver the current document immediately so subscribers never wait on the first
        // change if there's already content (e.g. a late subscriber).
        let initial = store.fetch_log_document(task_id).await;
        if tx.send(initial).await.is_err() {
            return Ok(stream_from_receiver(rx));
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    notification = listener.recv() => {
                        let notification = match notification {
                            Ok(n) => n,
                            Err(err) => {
                                tracing::warn!(event = "task_store.listen.error", error = %err, "log listener error");
                                break;
                            }
                        };
                        let Ok(notified_task_id) = notification.payload().parse::<Uuid>() else {
                            continue;
                        };
                        if notified_task_id != task_id {
                            continue;
                        }
                        let doc = store.fetch_log_document(task_id).await;
                        if tx.send(doc).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(stream_from_receiver(rx))
    }
}
