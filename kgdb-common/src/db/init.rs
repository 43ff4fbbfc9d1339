//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up to date.
//! Every statement is idempotent so this runs on each startup.
//!
//! Uniqueness rules that the ingest core relies on live here, at the storage
//! layer, not in process memory:
//! - one gene per external identifier (`genes.hgnc_id`)
//! - one evidence row per (gene, source)
//! - one *pending* staging entry per cleaned mention text
//! - one progress row per source

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every connection
const BUSY_TIMEOUT_MS: u64 = 250;

/// Open (creating if needed) the database and initialize the schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    // Concurrent pipelines write in parallel; WAL gives one writer + many readers
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    init_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_genes_table(pool).await?;
    create_gene_aliases_table(pool).await?;
    create_evidence_table(pool).await?;
    create_staging_table(pool).await?;
    create_progress_table(pool).await?;
    create_cache_table(pool).await?;
    create_scores_table(pool).await?;

    info!("Database schema initialized");
    Ok(())
}

pub async fn create_genes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS genes (
            id TEXT PRIMARY KEY,
            hgnc_id TEXT NOT NULL UNIQUE,
            symbol TEXT NOT NULL,
            aliases TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_genes_symbol ON genes(symbol COLLATE NOCASE)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn create_gene_aliases_table(pool: &SqlitePool) -> Result<()> {
    // Aliases are stored upper-cased; lookups upper-case the queried text
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gene_aliases (
            alias TEXT NOT NULL,
            gene_id TEXT NOT NULL REFERENCES genes(id) ON DELETE CASCADE,
            PRIMARY KEY (alias, gene_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_evidence_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS evidence (
            id TEXT PRIMARY KEY,
            gene_id TEXT NOT NULL REFERENCES genes(id),
            source_name TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            evidence_date TEXT,
            source_score REAL,
            lineage TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (gene_id, source_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_evidence_source ON evidence(source_name, gene_id)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn create_staging_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staging_entries (
            id TEXT PRIMARY KEY,
            original_text TEXT NOT NULL,
            cleaned_text TEXT NOT NULL,
            source_name TEXT NOT NULL,
            source_mentions TEXT NOT NULL DEFAULT '{}',
            mention_count INTEGER NOT NULL DEFAULT 1,
            attempt_log TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending',
            priority_score REAL NOT NULL DEFAULT 0.0,
            approved_symbol TEXT,
            approved_hgnc_id TEXT,
            approved_aliases TEXT NOT NULL DEFAULT '[]',
            linked_gene_id TEXT REFERENCES genes(id),
            reviewer TEXT,
            review_notes TEXT,
            reviewed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (status IN ('pending', 'approved', 'rejected', 'duplicate'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_staging_pending_text
        ON staging_entries(cleaned_text) WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_staging_queue ON staging_entries(status, priority_score DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_progress_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_progress (
            source_name TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'idle',
            run_id TEXT,
            current_page INTEGER NOT NULL DEFAULT 0,
            total_pages INTEGER,
            current_item INTEGER NOT NULL DEFAULT 0,
            total_items INTEGER,
            items_processed INTEGER NOT NULL DEFAULT 0,
            items_added INTEGER NOT NULL DEFAULT 0,
            items_updated INTEGER NOT NULL DEFAULT 0,
            items_failed INTEGER NOT NULL DEFAULT 0,
            current_operation TEXT NOT NULL DEFAULT '',
            last_error TEXT,
            checkpoint TEXT NOT NULL DEFAULT 'null',
            started_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL,
            CHECK (status IN ('idle', 'running', 'completed', 'failed', 'paused'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            namespace TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (namespace, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn create_scores_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gene_scores (
            gene_id TEXT PRIMARY KEY REFERENCES genes(id),
            per_source TEXT NOT NULL DEFAULT '{}',
            combined_score REAL NOT NULL,
            source_count INTEGER NOT NULL,
            evidence_count INTEGER NOT NULL,
            computed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scores_combined ON gene_scores(combined_score DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
