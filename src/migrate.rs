use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Import sources table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_sources (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            source_type TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            config TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Import runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_runs (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            status TEXT NOT NULL,
            error_message TEXT,
            entities_found INTEGER NOT NULL DEFAULT 0,
            entities_created INTEGER NOT NULL DEFAULT 0,
            entities_updated INTEGER NOT NULL DEFAULT 0,
            entities_skipped INTEGER NOT NULL DEFAULT 0,
            entities_failed INTEGER NOT NULL DEFAULT 0,
            progress_current INTEGER NOT NULL DEFAULT 0,
            progress_total INTEGER,
            current_file TEXT,
            file_hash TEXT,
            FOREIGN KEY (source_id) REFERENCES import_sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Entities table (generic shape, discriminated by kind)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_id TEXT,
            content_hash TEXT,
            occurred_at INTEGER,
            title TEXT,
            body TEXT,
            media_path TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entities_kind_hash ON entities(kind, content_hash)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_runs_source ON import_runs(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_runs_hash ON import_runs(file_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_runs_status ON import_runs(status)")
        .execute(pool)
        .await?;

    Ok(())
}
