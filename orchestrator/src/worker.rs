//! The Worker: claims a task, spawns the agent subprocess inside the app's repository,
//! streams its stdout into a Log Pipeline, renews the lease, and finalizes the task.
//!
//! Grounded in the original's `cmd/runner/main.go` loop (work channel bounded by
//! `maxNumberOfSubProcesses = 3`, a renewal goroutine per claimed task, `DeleteLock` +
//! `UpdateTask` on completion) and `pkg/worker/work.go` (subprocess argv, cwd, and the
//! four-variable environment), adapted to scope cancellation in place of the original's
//! `taskInProgress` boolean (see `spec.md` §9).

use anyhow::Context;
use log_pipeline::LogPipeline;
use std::{process::Stdio, sync::Arc, time::Duration};
use task_coordinator::{Claim, Coordinator};
use task_store::DocumentStore;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::Semaphore,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;

const SYSTEM_INSTRUCTION: &str = "The app you generate will be spun up programmatically by the \
platform that manages these apps. Please ensure that you create a run.sh file in the project \
root with steps that run the web application or the API server. The port will be passed in as \
the first argument. Please remember that users will enhance apps that you build, so create \
run.sh when it does not exist, else update it as necessary.";

pub struct Worker {
    cfg: Config,
    store: Arc<dyn DocumentStore>,
    coordinator: Coordinator,
}

impl Worker {
    pub fn new(cfg: Config, store: Arc<dyn DocumentStore>, coordinator: Coordinator) -> Self {
        Self {
            cfg,
            store,
            coordinator,
        }
    }

    /// Steady-state claim loop, bounded to `worker_concurrency` concurrent per-task scopes
    /// (one per distinct app). Returns once `shutdown` fires and every in-flight scope drains.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.cfg.worker_concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore is never closed"),
            };

            let claim = tokio::select! {
                _ = shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                claim = self.coordinator.claim() => claim,
            };

            let claim = match claim {
                Ok(claim) => claim,
                Err(err) => {
                    tracing::warn!(event = "worker.claim.error", error = %err, "claim failed, backing off");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    continue;
                }
            };

            let cfg = self.cfg.clone();
            let store = self.store.clone();
            let coordinator = self.coordinator.clone();
            let task_shutdown = shutdown.clone();

            in_flight.spawn(async move {
                let _permit = permit;
                run_one(cfg, store, coordinator, claim, task_shutdown).await;
            });

            // Reap finished scopes without blocking the claim loop.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        Ok(())
    }
}

/// One claimed task's full lifecycle. Never propagates an error out of itself — every branch
/// here converts to a recovered action or a terminal task state, per `spec.md` §7.
async fn run_one(
    cfg: Config,
    store: Arc<dyn DocumentStore>,
    coordinator: Coordinator,
    claim: Claim,
    worker_shutdown: CancellationToken,
) {
    let Claim {
        app_id,
        task_id,
        lease_token,
        ..
    } = claim;

    let task_scope = CancellationToken::new();
    let renewal = {
        let coordinator = coordinator.clone();
        let task_scope = task_scope.clone();
        let renew_interval = Duration::from_secs(cfg.lease_renew_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_scope.cancelled() => return,
                    _ = tokio::time::sleep(renew_interval) => {
                        if let Err(err) = coordinator.renew(app_id, lease_token).await {
                            tracing::warn!(
                                event = "worker.renew.error",
                                %app_id, %task_id, error = %err,
                                "lease renewal failed"
                            );
                        }
                    }
                }
            }
        })
    };

    let outcome = tokio::select! {
        _ = worker_shutdown.cancelled() => {
            // Graceful shutdown releases nothing here: the subprocess is still running, and
            // per spec.md §9 an in-flight task relies on lease expiry for recovery rather than
            // a proactive release.
            task_scope.cancel();
            renewal.abort();
            return;
        }
        outcome = run_subprocess(&cfg, store.clone(), app_id, task_id) => outcome,
    };

    task_scope.cancel();
    let _ = renewal.await;

    if let Err(err) = coordinator.release(app_id, lease_token).await {
        tracing::warn!(event = "worker.release.error", %app_id, error = %err, "lease release failed");
    }

    // A subprocess-spawn or wait failure still finalizes the task as completed — see
    // spec.md §7's "Subprocess spawn failure" row.
    let succeeded = outcome.unwrap_or_else(|err| {
        tracing::warn!(
            event = "worker.subprocess.error",
            %app_id, %task_id, error = %err,
            "subprocess run failed"
        );
        false
    });

    if let Err(err) = store.mark_completed(task_id, succeeded).await {
        tracing::warn!(event = "worker.complete.error", %task_id, error = %err, "failed to mark task completed");
    }

    tracing::info!(event = "worker.task.completed", %app_id, %task_id, succeeded, "task finished");
}

/// Spawns the agent subprocess and streams its stdout into a fresh Log Pipeline as bytes
/// arrive. Returns `Ok(true)`/`Ok(false)` for the subprocess's exit status; per `spec.md` §7
/// a non-zero exit is still a normal completion, recorded only via the `succeeded` flag.
async fn run_subprocess(
    cfg: &Config,
    store: Arc<dyn DocumentStore>,
    app_id: Uuid,
    task_id: Uuid,
) -> anyhow::Result<bool> {
    let app = store.get_app(app_id).await.context("load app")?;
    let task = store.get_task(task_id).await.context("load task")?;

    let brief = format!(
        "Important Instructions\n{}\nTask Title: {}\nTask Description: {}",
        SYSTEM_INSTRUCTION, task.title, task.description
    );

    let repo_dir = std::path::Path::new(&cfg.repositories_root).join(app_id.to_string());

    // db_user/db_password are opaque to the core (task_store::App's doc comment) and may
    // contain URI-reserved characters; build the URI through `url::Url` rather than
    // interpolating them into the string directly so they're percent-encoded.
    let mut mongo_uri = url::Url::parse("mongodb://localhost:27017").context("parse mongo uri template")?;
    mongo_uri
        .set_username(&app.db_user)
        .map_err(|_| anyhow::anyhow!("invalid mongo username for app {app_id}"))?;
    mongo_uri
        .set_password(Some(&app.db_password))
        .map_err(|_| anyhow::anyhow!("invalid mongo password for app {app_id}"))?;

    let mut cmd = Command::new(&cfg.agent_bin);
    cmd.args([
        "-p",
        "--verbose",
        "--output-format",
        "stream-json",
        "--dangerously-skip-permissions",
        &brief,
    ])
    .current_dir(&repo_dir)
    .env_clear()
    .env("ANTHROPIC_API_KEY", &cfg.agent_api_key)
    .env("MONGO_CONNECTION_STRING", mongo_uri.as_str())
    .env("MONGO_DB_NAME", &app.db_name)
    .env("APP_BUCKET_NAME", &app.bucket_name)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    // Cancelling the worker's root scope must kill in-flight subprocesses (spec.md §5):
    // dropping the `run_subprocess` future on shutdown drops `child`, and this flag makes that
    // drop issue the kill instead of orphaning the process.
    .kill_on_drop(true);

    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(
                event = "worker.spawn.error",
                %app_id, %task_id, error = %err,
                "subprocess spawn failed"
            );
            return Ok(false);
        }
    };

    let stdout = child.stdout.take().context("take subprocess stdout")?;
    let stderr = child.stderr.take().context("take subprocess stderr")?;

    let stdout_task = tokio::spawn(async move {
        let mut pipeline = LogPipeline::new(task_id, store);
        let mut reader = stdout;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = pipeline.feed(&buf[..n]).await {
                        tracing::warn!(
                            event = "worker.log_pipeline.append_error",
                            %task_id, error = %err,
                            "dropping log batch"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(event = "worker.stdout.read_error", %task_id, error = %err, "stdout read failed");
                    break;
                }
            }
        }
        if let Err(err) = pipeline.flush().await {
            tracing::warn!(event = "worker.log_pipeline.flush_error", %task_id, error = %err, "flush failed");
        }
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(event = "worker.subprocess.stderr", %task_id, line = %line, "agent stderr");
        }
    });

    let status = child.wait().await.context("wait for subprocess")?;
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(status.success())
}
