//! Background job wrapper for ingestion runs.
//!
//! Wraps one coordinator run as a retryable, cancellable unit. Transient
//! infrastructure failures (database connectivity, specific disk I/O
//! codes) retry with exponential backoff; missing files and permission
//! errors reject immediately; anything unrecognized is conservatively
//! treated as fatal so a broken job can never retry forever.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::ArchiveError;
use crate::coordinator::IngestionCoordinator;
use crate::hash::{compute_file_hash, HashError};
use crate::hooks::HookRegistry;
use crate::models::{EntityKind, ImportRun, ImportSource, ImportStatus, SourceType};
use crate::progress::ProgressCallback;
use crate::registry::IngesterRegistry;
use crate::store::{IngestionStore, StoreError};

/// Retry policy for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(60),
            backoff_max: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): exponential
    /// doubling from the base, capped at the maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Shared dependencies for background ingestion jobs.
pub struct JobContext {
    pub store: Arc<dyn IngestionStore>,
    pub ingesters: Arc<IngesterRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub batch_size: usize,
    pub flush_interval: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Error)]
pub enum JobError {
    /// Fatal: the job must not be requeued.
    #[error("job rejected: {reason}")]
    Rejected { reason: String },
    /// Transient failures persisted through every allowed retry.
    #[error("retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

/// Summary returned to the job transport.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub import_run_id: String,
    pub status: ImportStatus,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Fatal,
    Transient,
}

fn is_transient_db_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Classify an error chain as transient (retry with backoff) or fatal
/// (reject without retry).
///
/// The transient set is a closed list: database connectivity failures and
/// the disk I/O codes EIO, ENOSPC, and EROFS. Unknown errors are fatal.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(io.raw_os_error(), Some(5) | Some(28) | Some(30)) {
                return ErrorClass::Transient;
            }
            if matches!(
                io.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) {
                return ErrorClass::Fatal;
            }
        }
        if let Some(StoreError::Database(db)) = cause.downcast_ref::<StoreError>() {
            if is_transient_db_error(db) {
                return ErrorClass::Transient;
            }
        }
        if let Some(db) = cause.downcast_ref::<sqlx::Error>() {
            if is_transient_db_error(db) {
                return ErrorClass::Transient;
            }
        }
        if let Some(HashError::NotFound(_)) = cause.downcast_ref::<HashError>() {
            return ErrorClass::Fatal;
        }
        if let Some(ArchiveError::NotFound(_)) = cause.downcast_ref::<ArchiveError>() {
            return ErrorClass::Fatal;
        }
    }

    ErrorClass::Fatal
}

async fn run_once(
    ctx: &JobContext,
    import_run_id: &str,
    path: &str,
    entity_kinds: Option<&BTreeSet<EntityKind>>,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<JobSummary> {
    // The wrapped run record is the failure-marking anchor; it must exist.
    if ctx.store.get_run(import_run_id).await?.is_none() {
        anyhow::bail!("ImportRun not found: {}", import_run_id);
    }

    let mut coordinator = IngestionCoordinator::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.ingesters),
        Arc::clone(&ctx.hooks),
    )
    .with_batch_size(ctx.batch_size)
    .with_flush_interval(ctx.flush_interval);

    if let Some(callback) = progress {
        coordinator = coordinator.with_progress_callback(callback);
    }

    let result = coordinator
        .run(Path::new(path), entity_kinds, None, None)
        .await?;

    Ok(JobSummary {
        import_run_id: result.import_run.id.clone(),
        status: result.import_run.status,
        created: result.stats.created,
        updated: result.stats.updated,
        skipped: result.stats.skipped,
        failed: result.stats.failed,
    })
}

/// Run an ingestion job to completion, retrying transient failures.
///
/// `data_types` optionally restricts the import to a set of entity kind
/// string codes. The run is only marked FAILED on a fatal error or after
/// retries are exhausted, never on an individual retry attempt.
pub async fn ingest_file(
    ctx: &JobContext,
    import_run_id: &str,
    path: &str,
    data_types: Option<&[String]>,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<JobSummary, JobError> {
    info!(run_id = import_run_id, path, "starting ingestion job");

    let entity_kinds: Option<BTreeSet<EntityKind>> = match data_types {
        Some(codes) => {
            let mut kinds = BTreeSet::new();
            for code in codes {
                match EntityKind::from_str(code) {
                    Ok(kind) => {
                        kinds.insert(kind);
                    }
                    Err(e) => {
                        return Err(JobError::Rejected {
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Some(kinds)
        }
        None => None,
    };

    let mut attempt = 0u32;
    loop {
        match run_once(
            ctx,
            import_run_id,
            path,
            entity_kinds.as_ref(),
            progress.clone(),
        )
        .await
        {
            Ok(summary) => return Ok(summary),
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(run_id = import_run_id, error = %reason, "ingestion job failed");

                match classify_error(&e) {
                    ErrorClass::Transient if attempt < ctx.retry.max_retries => {
                        let delay = ctx.retry.delay(attempt);
                        warn!(
                            attempt = attempt + 1,
                            delay_secs = delay.as_secs(),
                            "transient error, will retry"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    ErrorClass::Transient => {
                        mark_import_failed(ctx.store.as_ref(), import_run_id, &reason).await;
                        return Err(JobError::RetriesExhausted {
                            attempts: attempt + 1,
                            reason,
                        });
                    }
                    ErrorClass::Fatal => {
                        mark_import_failed(ctx.store.as_ref(), import_run_id, &reason).await;
                        return Err(JobError::Rejected { reason });
                    }
                }
            }
        }
    }
}

async fn mark_import_failed(store: &dyn IngestionStore, import_run_id: &str, message: &str) {
    let result = async {
        if let Some(mut run) = store.get_run(import_run_id).await? {
            run.status = ImportStatus::Failed;
            run.error_message = Some(message.to_string());
            run.completed_at = Some(Utc::now());
            store.update_run(&run).await?;
        }
        Ok::<(), StoreError>(())
    }
    .await;

    if let Err(e) = result {
        error!(run_id = import_run_id, error = %e, "failed to mark import as failed");
    }
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone)]
pub struct CancelResult {
    pub success: bool,
    pub import_run_id: Option<String>,
    pub error: Option<String>,
}

/// Cancel a run that has not yet finished.
///
/// Rejects (success = false) when the run is missing or already in a
/// terminal state; a cancelled run is distinguishable from a failed one.
pub async fn cancel_import(store: &dyn IngestionStore, import_run_id: &str) -> CancelResult {
    match store.get_run(import_run_id).await {
        Ok(None) => CancelResult {
            success: false,
            import_run_id: None,
            error: Some(format!("ImportRun not found: {}", import_run_id)),
        },
        Ok(Some(mut run)) => {
            if run.is_finished() {
                return CancelResult {
                    success: false,
                    import_run_id: Some(run.id),
                    error: Some("Import already finished".to_string()),
                };
            }

            run.status = ImportStatus::Cancelled;
            run.completed_at = Some(Utc::now());
            match store.update_run(&run).await {
                Ok(()) => CancelResult {
                    success: true,
                    import_run_id: Some(run.id),
                    error: None,
                },
                Err(e) => {
                    error!(run_id = import_run_id, error = %e, "failed to cancel import");
                    CancelResult {
                        success: false,
                        import_run_id: Some(run.id),
                        error: Some(e.to_string()),
                    }
                }
            }
        }
        Err(e) => {
            error!(run_id = import_run_id, error = %e, "failed to cancel import");
            CancelResult {
                success: false,
                import_run_id: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Create the ImportSource and ImportRun records, then hand the run off
/// to a background task. Returns `(job_id, import_run_id)`.
pub async fn start_ingestion(
    ctx: Arc<JobContext>,
    path: &Path,
    entity_kinds: Option<Vec<EntityKind>>,
) -> Result<(String, String)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let source = ImportSource::new(SourceType::Generic, name);
    ctx.store.insert_source(&source).await?;

    let file_hash = if path.is_file() {
        compute_file_hash(path).ok()
    } else {
        None
    };

    let run = ImportRun::new(&source.id, file_hash);
    ctx.store.insert_run(&run).await?;
    let import_run_id = run.id.clone();

    let job_id = Uuid::new_v4().to_string();
    let data_types: Option<Vec<String>> =
        entity_kinds.map(|kinds| kinds.iter().map(|k| k.as_str().to_string()).collect());
    let path_string = path.to_string_lossy().into_owned();
    let run_id = import_run_id.clone();
    let job_ctx = Arc::clone(&ctx);

    tokio::spawn(async move {
        if let Err(e) = ingest_file(
            &job_ctx,
            &run_id,
            &path_string,
            data_types.as_deref(),
            None,
        )
        .await
        {
            error!(run_id = %run_id, error = %e, "background ingestion job failed");
        }
    });

    Ok((job_id, import_run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn disk_io_codes_are_transient() {
        for code in [5, 28, 30] {
            let err = anyhow::Error::from(std::io::Error::from_raw_os_error(code));
            assert_eq!(classify_error(&err), ErrorClass::Transient, "code {code}");
        }
    }

    #[test]
    fn missing_file_and_permissions_are_fatal() {
        let not_found = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        assert_eq!(classify_error(&not_found), ErrorClass::Fatal);

        let denied = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "nope",
        ));
        assert_eq!(classify_error(&denied), ErrorClass::Fatal);

        let hash = anyhow::Error::from(HashError::NotFound("/gone".into()));
        assert_eq!(classify_error(&hash), ErrorClass::Fatal);
    }

    #[test]
    fn pool_errors_are_transient() {
        let err = anyhow::Error::from(StoreError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(classify_error(&err), ErrorClass::Transient);
    }

    #[test]
    fn unknown_errors_are_fatal() {
        assert_eq!(classify_error(&anyhow!("mystery")), ErrorClass::Fatal);
    }

    #[test]
    fn classification_walks_the_context_chain() {
        let inner = anyhow::Error::from(std::io::Error::from_raw_os_error(28));
        let wrapped = inner.context("while flushing batch");
        assert_eq!(classify_error(&wrapped), ErrorClass::Transient);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(120));
        assert_eq!(policy.delay(2), Duration::from_secs(240));
        assert_eq!(policy.delay(10), Duration::from_secs(600));
    }
}
