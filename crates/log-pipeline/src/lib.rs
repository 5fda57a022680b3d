//! Streaming JSON-lines sink for the agent subprocess's stdout.
//!
//! Two responsibilities: line reassembly across arbitrary byte-chunk boundaries, and
//! projection of parsed Update records into Log Messages appended to the task's document.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use task_store::{DocumentStore, LogMessage};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, task_store::Error>;

#[derive(Debug, Deserialize)]
struct Update {
    #[serde(default)]
    message: UpdateMessage,
}

#[derive(Debug, Deserialize, Default)]
struct UpdateMessage {
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { name: String },
    #[serde(other)]
    Other,
}

/// Parses one complete line and projects it into zero or more Log Messages. Returns an empty
/// vec for an unparseable or empty line — the caller decides what that means for the carry.
fn project_line(line: &[u8]) -> std::result::Result<Vec<LogMessage>, ()> {
    let text = std::str::from_utf8(line).map_err(|_| ())?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let update: Update = serde_json::from_str(text).map_err(|_| ())?;
    let mut messages = Vec::new();
    for item in update.message.content {
        match item {
            ContentItem::Text { text } => messages.push(LogMessage {
                time: Some(Utc::now()),
                title: "update".to_string(),
                text,
            }),
            ContentItem::ToolUse { name } => messages.push(LogMessage {
                time: None,
                title: "tool".to_string(),
                text: name,
            }),
            ContentItem::Other => {}
        }
    }
    Ok(messages)
}

/// One pipeline instance per task, fed by a single source (the subprocess's stdout reader).
/// No in-process lock is required: single writer, and `append_log` is the atomicity boundary.
pub struct LogPipeline {
    task_id: Uuid,
    store: Arc<dyn DocumentStore>,
    carry: Vec<u8>,
}

impl LogPipeline {
    pub fn new(task_id: Uuid, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            task_id,
            store,
            carry: Vec::new(),
        }
    }

    /// Appends a chunk of subprocess stdout, reassembles complete lines, and flushes any
    /// resulting messages to the store as a single atomic batch.
    pub async fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.carry.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            let Some(pos) = self.carry.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            match project_line(line) {
                Ok(mut projected) => messages.append(&mut projected),
                Err(()) => {
                    tracing::warn!(
                        event = "log_pipeline.malformed_line",
                        task_id = %self.task_id,
                        "dropping unparseable line"
                    );
                }
            }
        }

        if !messages.is_empty() {
            self.store.append_log(self.task_id, messages).await?;
        }
        Ok(())
    }

    /// Drains the carry: if non-empty after trimming, attempts one last projection, then
    /// resets. Call once after the subprocess has exited.
    pub async fn flush(&mut self) -> Result<()> {
        let remaining = std::mem::take(&mut self.carry);
        let trimmed_is_empty = std::str::from_utf8(&remaining)
            .map(|s| s.trim().is_empty())
            .unwrap_or(false);
        if trimmed_is_empty {
            return Ok(());
        }

        match project_line(&remaining) {
            Ok(messages) if !messages.is_empty() => {
                self.store.append_log(self.task_id, messages).await?;
            }
            Ok(_) => {}
            Err(()) => {
                tracing::warn!(
                    event = "log_pipeline.malformed_line",
                    task_id = %self.task_id,
                    "dropping unparseable trailing fragment"
                );
            }
        }
        Ok(())
    }
}
