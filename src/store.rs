//! Persistence port for the ingestion pipeline.
//!
//! The coordinator, progress tracker, and job layer all talk to the
//! [`IngestionStore`] trait rather than SQLite directly, so tests can
//! inject failing or in-memory implementations. [`SqliteStore`] is the
//! production implementation over the sqlx pool.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

use crate::models::{Entity, EntityKind, ImportRun, ImportSource};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Transactional persistence operations the pipeline depends on.
#[async_trait]
pub trait IngestionStore: Send + Sync {
    async fn insert_source(&self, source: &ImportSource) -> Result<(), StoreError>;

    async fn insert_run(&self, run: &ImportRun) -> Result<(), StoreError>;

    /// Persist the run's current counters and status.
    async fn update_run(&self, run: &ImportRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: &str) -> Result<Option<ImportRun>, StoreError>;

    /// Most recent completed run that imported a file with this hash.
    async fn latest_completed_run_with_hash(
        &self,
        file_hash: &str,
    ) -> Result<Option<ImportRun>, StoreError>;

    async fn list_runs(&self, limit: i64) -> Result<Vec<ImportRun>, StoreError>;

    /// Whether an entity of this kind with this content hash exists.
    ///
    /// An existence check, not a uniqueness constraint: concurrent runs on
    /// overlapping content can still race (single-writer-per-run design).
    async fn entity_exists(&self, kind: EntityKind, content_hash: &str)
        -> Result<bool, StoreError>;

    /// Insert a batch of entities in one transaction.
    async fn insert_entities(&self, entities: &[Entity]) -> Result<(), StoreError>;

    async fn count_entities(&self, kind: EntityKind) -> Result<u64, StoreError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp: {}", secs)))
}

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ImportRun, StoreError> {
    let status: String = row.try_get("status")?;
    let started_at: i64 = row.try_get("started_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(ImportRun {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        started_at: from_ts(started_at)?,
        completed_at: completed_at.map(from_ts).transpose()?,
        status: FromStr::from_str(&status)
            .map_err(|e| StoreError::Corrupt(format!("{}", e)))?,
        error_message: row.try_get("error_message")?,
        entities_found: row.try_get::<i64, _>("entities_found")? as u64,
        entities_created: row.try_get::<i64, _>("entities_created")? as u64,
        entities_updated: row.try_get::<i64, _>("entities_updated")? as u64,
        entities_skipped: row.try_get::<i64, _>("entities_skipped")? as u64,
        entities_failed: row.try_get::<i64, _>("entities_failed")? as u64,
        progress_current: row.try_get::<i64, _>("progress_current")? as u64,
        progress_total: row
            .try_get::<Option<i64>, _>("progress_total")?
            .map(|v| v as u64),
        current_file: row.try_get("current_file")?,
        file_hash: row.try_get("file_hash")?,
    })
}

#[async_trait]
impl IngestionStore for SqliteStore {
    async fn insert_source(&self, source: &ImportSource) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_sources (id, created_at, updated_at, source_type, name, description, config, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(ts(source.created_at))
        .bind(ts(source.updated_at))
        .bind(source.source_type.as_str())
        .bind(&source.name)
        .bind(&source.description)
        .bind(&source.config)
        .bind(source.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_runs (
                id, source_id, started_at, completed_at, status, error_message,
                entities_found, entities_created, entities_updated, entities_skipped,
                entities_failed, progress_current, progress_total, current_file, file_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.source_id)
        .bind(ts(run.started_at))
        .bind(run.completed_at.map(ts))
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .bind(run.entities_found as i64)
        .bind(run.entities_created as i64)
        .bind(run.entities_updated as i64)
        .bind(run.entities_skipped as i64)
        .bind(run.entities_failed as i64)
        .bind(run.progress_current as i64)
        .bind(run.progress_total.map(|v| v as i64))
        .bind(&run.current_file)
        .bind(&run.file_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE import_runs SET
                completed_at = ?,
                status = ?,
                error_message = ?,
                entities_found = ?,
                entities_created = ?,
                entities_updated = ?,
                entities_skipped = ?,
                entities_failed = ?,
                progress_current = ?,
                progress_total = ?,
                current_file = ?,
                file_hash = ?
            WHERE id = ?
            "#,
        )
        .bind(run.completed_at.map(ts))
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .bind(run.entities_found as i64)
        .bind(run.entities_created as i64)
        .bind(run.entities_updated as i64)
        .bind(run.entities_skipped as i64)
        .bind(run.entities_failed as i64)
        .bind(run.progress_current as i64)
        .bind(run.progress_total.map(|v| v as i64))
        .bind(&run.current_file)
        .bind(&run.file_hash)
        .bind(&run.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM import_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| run_from_row(&r)).transpose()
    }

    async fn latest_completed_run_with_hash(
        &self,
        file_hash: &str,
    ) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM import_runs
            WHERE file_hash = ? AND status = 'completed'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| run_from_row(&r)).transpose()
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<ImportRun>, StoreError> {
        let rows = sqlx::query("SELECT * FROM import_runs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn entity_exists(
        &self,
        kind: EntityKind,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM entities WHERE kind = ? AND content_hash = ?",
        )
        .bind(kind.as_str())
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_entities(&self, entities: &[Entity]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for entity in entities {
            sqlx::query(
                r#"
                INSERT INTO entities (
                    id, kind, source_type, source_id, content_hash, occurred_at,
                    title, body, media_path, metadata_json, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entity.id)
            .bind(entity.kind.as_str())
            .bind(entity.source_type.as_str())
            .bind(&entity.source_id)
            .bind(&entity.content_hash)
            .bind(entity.occurred_at.map(ts))
            .bind(&entity.title)
            .bind(&entity.body)
            .bind(&entity.media_path)
            .bind(&entity.metadata_json)
            .bind(ts(entity.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_entities(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}
