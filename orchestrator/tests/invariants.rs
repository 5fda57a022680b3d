//! Integration tests for the Worker against a real Postgres-backed Document Store and
//! Coordinator, using small shell-script stand-ins for the agent subprocess (seed scenarios
//! from spec.md §8 that need an actual child process to exercise end to end).
//!
//! Gated behind `ORCHESTRATOR_TEST_DATABASE_URL`: skipped (not failed) when unset, matching
//! the gating style already used by `task-coordinator`'s own Postgres-backed tests.

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{path::PathBuf, sync::Arc, time::Duration};
use task_coordinator::Coordinator;
use task_store::{postgres::PgDocumentStore, DocumentStore, TaskStatus};
use task_orchestrator::{config::Config, worker::Worker};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/fixtures");
    path.push(name);
    path.to_string_lossy().into_owned()
}

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("ORCHESTRATOR_TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("connect test db");
    sqlx::migrate!("../crates/task-store/migrations")
        .run(&pool)
        .await
        .expect("migrate task-store schema");
    sqlx::migrate!("../crates/task-coordinator/migrations")
        .run(&pool)
        .await
        .expect("migrate task-coordinator schema");
    Some(pool)
}

fn base_config(pool_url: &str, agent_bin: &str, repositories_root: &str) -> Config {
    Config {
        state_database_url: pool_url.to_string(),
        agent_bin: agent_bin.to_string(),
        agent_api_key: "test-key".to_string(),
        repositories_root: repositories_root.to_string(),
        lease_ttl_secs: 30,
        lease_renew_secs: 15,
        worker_poll_ms: 20,
        worker_concurrency: 1,
        lease_reaper_poll_ms: 500,
    }
}

async fn make_app_and_repo_dir(
    store: &dyn DocumentStore,
    repositories_root: &std::path::Path,
) -> Uuid {
    let app = store
        .create_app("acme", "acme_db", "acme_user", "acme_pw", "acme-bucket")
        .await
        .expect("create app");
    tokio::fs::create_dir_all(repositories_root.join(app.id.to_string()))
        .await
        .expect("create repo dir");
    app.id
}

async fn wait_for_completion(
    store: &dyn DocumentStore,
    task_id: Uuid,
    timeout: Duration,
) -> task_store::Task {
    tokio::time::timeout(timeout, async {
        loop {
            let task = store.get_task(task_id).await.expect("get task");
            if task.status == TaskStatus::Completed {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    })
    .await
    .expect("task did not complete in time")
}

#[tokio::test]
async fn happy_path_three_messages_then_completed() {
    let Some(pool) = test_pool().await else { return };
    let store = PgDocumentStore::new(pool.clone());
    let repo_root = tempfile::tempdir().unwrap();

    let app_id = make_app_and_repo_dir(&store, repo_root.path()).await;
    let task = store
        .create_task(app_id, "build thing", "do the thing")
        .await
        .unwrap();

    let cfg = base_config(
        &std::env::var("ORCHESTRATOR_TEST_DATABASE_URL").unwrap(),
        &fixture("fake_agent_happy.sh"),
        repo_root.path().to_str().unwrap(),
    );

    store
        .update_task(app_id, task.id, &task.title, &task.description, TaskStatus::InProgress)
        .await
        .unwrap();
    let coordinator = Coordinator::new(pool.clone(), Duration::from_secs(30), Duration::from_millis(20));
    coordinator.enqueue(app_id, task.id).await.unwrap();

    let store_arc: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();
    let worker_handle = tokio::spawn(Worker::new(cfg, store_arc, coordinator).run(worker_shutdown));

    let completed = wait_for_completion(&store, task.id, Duration::from_secs(10)).await;
    assert_eq!(completed.succeeded, Some(true));

    let log = store.get_log(task.id).await.unwrap();
    assert_eq!(log.messages.len(), 3);
    assert_eq!(log.messages[0].title, "update");
    assert_eq!(log.messages[0].text, "hello");
    assert!(log.messages[0].time.is_some());
    assert_eq!(log.messages[1].title, "tool");
    assert_eq!(log.messages[1].text, "grep");
    assert_eq!(log.messages[2].title, "update");
    assert_eq!(log.messages[2].text, "done");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_handle).await;
}

#[tokio::test]
async fn subprocess_non_zero_exit_is_still_completed_but_unsucceeded() {
    let Some(pool) = test_pool().await else { return };
    let store = PgDocumentStore::new(pool.clone());
    let repo_root = tempfile::tempdir().unwrap();

    let app_id = make_app_and_repo_dir(&store, repo_root.path()).await;
    let task = store.create_task(app_id, "flaky", "will fail").await.unwrap();

    let cfg = base_config(
        &std::env::var("ORCHESTRATOR_TEST_DATABASE_URL").unwrap(),
        &fixture("fake_agent_fail.sh"),
        repo_root.path().to_str().unwrap(),
    );

    store
        .update_task(app_id, task.id, &task.title, &task.description, TaskStatus::InProgress)
        .await
        .unwrap();
    let coordinator = Coordinator::new(pool.clone(), Duration::from_secs(30), Duration::from_millis(20));
    coordinator.enqueue(app_id, task.id).await.unwrap();

    let store_arc: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();
    let worker_handle = tokio::spawn(Worker::new(cfg, store_arc, coordinator).run(worker_shutdown));

    let completed = wait_for_completion(&store, task.id, Duration::from_secs(10)).await;
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.succeeded, Some(false));

    let log = store.get_log(task.id).await.unwrap();
    assert_eq!(log.messages.len(), 1);
    assert_eq!(log.messages[0].text, "partial");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_handle).await;
}

#[tokio::test]
async fn subprocess_spawn_failure_still_finalizes_task() {
    let Some(pool) = test_pool().await else { return };
    let store = PgDocumentStore::new(pool.clone());
    let repo_root = tempfile::tempdir().unwrap();

    let app_id = make_app_and_repo_dir(&store, repo_root.path()).await;
    let task = store
        .create_task(app_id, "unspawnable", "agent binary does not exist")
        .await
        .unwrap();

    let cfg = base_config(
        &std::env::var("ORCHESTRATOR_TEST_DATABASE_URL").unwrap(),
        "/nonexistent/binary/does-not-exist",
        repo_root.path().to_str().unwrap(),
    );

    store
        .update_task(app_id, task.id, &task.title, &task.description, TaskStatus::InProgress)
        .await
        .unwrap();
    let coordinator = Coordinator::new(pool.clone(), Duration::from_secs(30), Duration::from_millis(20));
    coordinator.enqueue(app_id, task.id).await.unwrap();

    let store_arc: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();
    let worker_handle = tokio::spawn(Worker::new(cfg, store_arc, coordinator).run(worker_shutdown));

    let completed = wait_for_completion(&store, task.id, Duration::from_secs(10)).await;
    assert_eq!(completed.succeeded, Some(false));

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_handle).await;
}

#[tokio::test]
async fn cross_app_tasks_run_concurrently() {
    let Some(pool) = test_pool().await else { return };
    let store = PgDocumentStore::new(pool.clone());
    let repo_root = tempfile::tempdir().unwrap();

    let app_a = make_app_and_repo_dir(&store, repo_root.path()).await;
    let app_b = make_app_and_repo_dir(&store, repo_root.path()).await;
    let task_a = store.create_task(app_a, "a", "a").await.unwrap();
    let task_b = store.create_task(app_b, "b", "b").await.unwrap();

    let mut cfg = base_config(
        &std::env::var("ORCHESTRATOR_TEST_DATABASE_URL").unwrap(),
        &fixture("fake_agent_slow.sh"),
        repo_root.path().to_str().unwrap(),
    );
    cfg.worker_concurrency = 2;

    for (app_id, task) in [(app_a, &task_a), (app_b, &task_b)] {
        store
            .update_task(app_id, task.id, &task.title, &task.description, TaskStatus::InProgress)
            .await
            .unwrap();
    }
    let coordinator = Coordinator::new(pool.clone(), Duration::from_secs(30), Duration::from_millis(20));
    coordinator.enqueue(app_a, task_a.id).await.unwrap();
    coordinator.enqueue(app_b, task_b.id).await.unwrap();

    let store_arc: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();
    let started = std::time::Instant::now();
    let worker_handle = tokio::spawn(Worker::new(cfg, store_arc, coordinator).run(worker_shutdown));

    wait_for_completion(&store, task_a.id, Duration::from_secs(10)).await;
    wait_for_completion(&store, task_b.id, Duration::from_secs(10)).await;
    let elapsed = started.elapsed();

    // Each fixture sleeps 1s; sequential execution would take >=2s. Allow generous slack for
    // scheduler/claim-poll overhead while still distinguishing parallel from serial.
    assert!(
        elapsed < Duration::from_millis(1900),
        "expected concurrent execution across apps, took {elapsed:?}"
    );

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_handle).await;
}

#[tokio::test]
async fn serialized_tasks_within_one_app_never_overlap() {
    let Some(pool) = test_pool().await else { return };
    let store = PgDocumentStore::new(pool.clone());
    let repo_root = tempfile::tempdir().unwrap();

    let app_id = make_app_and_repo_dir(&store, repo_root.path()).await;
    let task_1 = store.create_task(app_id, "first", "first").await.unwrap();
    let task_2 = store.create_task(app_id, "second", "second").await.unwrap();

    let mut cfg = base_config(
        &std::env::var("ORCHESTRATOR_TEST_DATABASE_URL").unwrap(),
        &fixture("fake_agent_slow.sh"),
        repo_root.path().to_str().unwrap(),
    );
    cfg.worker_concurrency = 3;

    for task in [&task_1, &task_2] {
        store
            .update_task(app_id, task.id, &task.title, &task.description, TaskStatus::InProgress)
            .await
            .unwrap();
    }
    let coordinator = Coordinator::new(pool.clone(), Duration::from_secs(30), Duration::from_millis(20));
    coordinator.enqueue(app_id, task_1.id).await.unwrap();
    coordinator.enqueue(app_id, task_2.id).await.unwrap();

    let store_arc: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();
    let started = std::time::Instant::now();
    let worker_handle = tokio::spawn(Worker::new(cfg, store_arc, coordinator).run(worker_shutdown));

    wait_for_completion(&store, task_1.id, Duration::from_secs(10)).await;
    wait_for_completion(&store, task_2.id, Duration::from_secs(10)).await;
    let elapsed = started.elapsed();

    // One app, one lease: the two 1s-sleeping tasks must run one after another even though
    // worker_concurrency allows running tasks from other apps in parallel.
    assert!(
        elapsed >= Duration::from_millis(1900),
        "expected serialized execution within one app, took {elapsed:?}"
    );

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_handle).await;
}
