//! Document Store: apps, tasks, and per-task log documents.
//!
//! The trait is the contract the rest of the core depends on; `postgres` is the only
//! implementation shipped here, but nothing above this crate assumes Postgres specifically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, pin::Pin};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod postgres;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow::anyhow!(message.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self { inner: value }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Authoring,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Authoring => "authoring",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authoring" => Some(TaskStatus::Authoring),
            "in-progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

/// A tenant: owns a repository working tree, a tenant database, and a bucket.
///
/// `db_name`/`db_user`/`db_password`/`bucket_name` are opaque to the core — never parsed or
/// validated here, only handed to the worker as environment variables for the agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Uuid,
    pub name: String,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub bucket_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub app_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Set once the task reaches `completed`: whether the agent subprocess exited zero.
    /// `status` never becomes anything but `completed` on subprocess failure — see DESIGN.md.
    pub succeeded: Option<bool>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDocument {
    pub id: Uuid,
    pub task_id: Uuid,
    pub messages: Vec<LogMessage>,
}

pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogDocument>> + Send>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_app(
        &self,
        name: &str,
        db_name: &str,
        db_user: &str,
        db_password: &str,
        bucket_name: &str,
    ) -> Result<App>;

    async fn get_app(&self, app_id: Uuid) -> Result<App>;

    /// Creates the task (status `authoring`) and its empty log document together.
    async fn create_task(&self, app_id: Uuid, title: &str, description: &str) -> Result<Task>;

    async fn get_task(&self, task_id: Uuid) -> Result<Task>;

    async fn update_task(
        &self,
        app_id: Uuid,
        task_id: Uuid,
        title: &str,
        description: &str,
        status: TaskStatus,
    ) -> Result<()>;

    /// Records subprocess exit outcome and moves the task to `completed`, regardless of
    /// whether the subprocess exited zero.
    async fn mark_completed(&self, task_id: Uuid, succeeded: bool) -> Result<()>;

    /// Atomic extend of the log document's message sequence. An empty batch is a no-op.
    async fn append_log(&self, task_id: Uuid, messages: Vec<LogMessage>) -> Result<()>;

    async fn get_log(&self, task_id: Uuid) -> Result<LogDocument>;

    /// Lazy sequence of full-document snapshots, one per change. Stops once `cancel` fires.
    async fn subscribe_logs(&self, task_id: Uuid, cancel: CancellationToken) -> Result<LogStream>;
}
