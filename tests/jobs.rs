//! Integration tests for the background job wrapper.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use shoebox::hooks::HookRegistry;
use shoebox::jobs::{ingest_file, start_ingestion, JobContext, JobError, RetryPolicy};
use shoebox::models::{EntityKind, ImportRun, ImportSource, ImportStatus, SourceType};
use shoebox::registry::IngesterRegistry;
use shoebox::store::{IngestionStore, SqliteStore, StoreError};
use shoebox::{db, migrate};

async fn setup_store(tmp: &TempDir) -> Arc<SqliteStore> {
    let pool = db::connect_path(&tmp.path().join("shoebox.db"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

fn job_context(store: Arc<dyn IngestionStore>) -> JobContext {
    JobContext {
        store,
        ingesters: Arc::new(IngesterRegistry::new()),
        hooks: Arc::new(HookRegistry::new()),
        batch_size: 100,
        flush_interval: 100,
        retry: RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
        },
    }
}

async fn seed_run(store: &SqliteStore) -> ImportRun {
    let source = ImportSource::new(SourceType::Generic, "job-test");
    store.insert_source(&source).await.unwrap();
    let run = ImportRun::new(&source.id, None);
    store.insert_run(&run).await.unwrap();
    run
}

#[tokio::test]
async fn successful_job_returns_summary() {
    let tmp = TempDir::new().unwrap();
    let store = setup_store(&tmp).await;
    let run = seed_run(&store).await;

    let input = tmp.path().join("notes");
    std::fs::create_dir(&input).unwrap();
    std::fs::write(input.join("a.md"), "note body").unwrap();

    let ctx = job_context(store.clone());
    let summary = ingest_file(
        &ctx,
        &run.id,
        input.to_str().unwrap(),
        None,
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.status, ImportStatus::Completed);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn missing_path_rejects_and_marks_run_failed() {
    let tmp = TempDir::new().unwrap();
    let store = setup_store(&tmp).await;
    let run = seed_run(&store).await;

    let ctx = job_context(store.clone());
    let err = ingest_file(&ctx, &run.id, "/no/such/export", None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Rejected { .. }));

    let failed = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ImportStatus::Failed);
    assert!(failed.error_message.is_some());
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn missing_run_record_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = setup_store(&tmp).await;

    let ctx = job_context(store.clone());
    let err = ingest_file(&ctx, "no-such-run", "/tmp", None, None)
        .await
        .unwrap_err();

    match err {
        JobError::Rejected { reason } => assert!(reason.contains("not found")),
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_entity_kind_code_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = setup_store(&tmp).await;
    let run = seed_run(&store).await;

    let ctx = job_context(store.clone());
    let err = ingest_file(
        &ctx,
        &run.id,
        "/tmp",
        Some(&["sandwich".to_string()]),
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, JobError::Rejected { .. }));
}

/// Store whose run lookups fail a fixed number of times before recovering.
struct FlakyLookups {
    inner: Arc<SqliteStore>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

#[async_trait]
impl IngestionStore for FlakyLookups {
    async fn insert_source(&self, source: &ImportSource) -> Result<(), StoreError> {
        self.inner.insert_source(source).await
    }
    async fn insert_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        self.inner.insert_run(run).await
    }
    async fn update_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        self.inner.update_run(run).await
    }
    async fn get_run(&self, id: &str) -> Result<Option<ImportRun>, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.get_run(id).await
    }
    async fn latest_completed_run_with_hash(
        &self,
        file_hash: &str,
    ) -> Result<Option<ImportRun>, StoreError> {
        self.inner.latest_completed_run_with_hash(file_hash).await
    }
    async fn list_runs(&self, limit: i64) -> Result<Vec<ImportRun>, StoreError> {
        self.inner.list_runs(limit).await
    }
    async fn entity_exists(
        &self,
        kind: EntityKind,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        self.inner.entity_exists(kind, content_hash).await
    }
    async fn insert_entities(
        &self,
        entities: &[shoebox::models::Entity],
    ) -> Result<(), StoreError> {
        self.inner.insert_entities(entities).await
    }
    async fn count_entities(&self, kind: EntityKind) -> Result<u64, StoreError> {
        self.inner.count_entities(kind).await
    }
}

#[tokio::test]
async fn transient_failures_retry_with_backoff_then_succeed() {
    let tmp = TempDir::new().unwrap();
    let sqlite = setup_store(&tmp).await;
    let run = seed_run(&sqlite).await;

    let input = tmp.path().join("notes");
    std::fs::create_dir(&input).unwrap();
    std::fs::write(input.join("a.md"), "note body").unwrap();

    let flaky = Arc::new(FlakyLookups {
        inner: sqlite.clone(),
        failures_left: AtomicU32::new(2),
        attempts: AtomicU32::new(0),
    });

    let ctx = job_context(flaky.clone() as Arc<dyn IngestionStore>);
    let summary = ingest_file(&ctx, &run.id, input.to_str().unwrap(), None, None)
        .await
        .unwrap();

    assert_eq!(summary.status, ImportStatus::Completed);
    // Two transient failures, then the successful attempt.
    assert!(flaky.attempts.load(Ordering::SeqCst) >= 3);

    // Retries alone never mark the run failed.
    let original = sqlite.get_run(&run.id).await.unwrap().unwrap();
    assert_ne!(original.status, ImportStatus::Failed);
}

#[tokio::test]
async fn exhausted_retries_reject_the_job() {
    let tmp = TempDir::new().unwrap();
    let sqlite = setup_store(&tmp).await;
    let run = seed_run(&sqlite).await;

    let flaky = Arc::new(FlakyLookups {
        inner: sqlite.clone(),
        failures_left: AtomicU32::new(u32::MAX),
        attempts: AtomicU32::new(0),
    });

    let ctx = job_context(flaky as Arc<dyn IngestionStore>);
    let err = ingest_file(&ctx, &run.id, "/tmp", None, None)
        .await
        .unwrap_err();

    match err {
        JobError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn start_ingestion_creates_records_and_runs_in_background() {
    let tmp = TempDir::new().unwrap();
    let store = setup_store(&tmp).await;

    let input = tmp.path().join("notes");
    std::fs::create_dir(&input).unwrap();
    std::fs::write(input.join("a.md"), "note body").unwrap();

    let ctx = Arc::new(job_context(store.clone()));
    let (job_id, import_run_id) =
        start_ingestion(ctx, &input, Some(vec![EntityKind::KnowledgeNote]))
            .await
            .unwrap();

    assert!(!job_id.is_empty());
    let seeded = store.get_run(&import_run_id).await.unwrap();
    assert!(seeded.is_some());

    // The background task runs the coordinator; wait for a completed run.
    let mut completed = false;
    for _ in 0..200 {
        let runs = store.list_runs(10).await.unwrap();
        if runs.iter().any(|r| r.status == ImportStatus::Completed) {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(completed, "background ingestion never completed");
    assert_eq!(
        store.count_entities(EntityKind::KnowledgeNote).await.unwrap(),
        1
    );
}
