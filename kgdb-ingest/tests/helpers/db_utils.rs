//! Database test utilities

use sqlx::SqlitePool;
use tempfile::TempDir;

/// File-backed database with the full schema.
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let pool = kgdb_common::db::init_database(&temp_dir.path().join("test_kgdb.db"))
        .await
        .expect("Failed to initialize database");
    (temp_dir, pool)
}
