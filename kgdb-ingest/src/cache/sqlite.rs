//! SQLite-backed primary cache (`cache_entries` table)

use async_trait::async_trait;
use chrono::Utc;
use kgdb_common::Result;
use serde_json::Value;
use sqlx::SqlitePool;
use std::time::Duration;

use super::CacheBackend;

pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Escape everything but `*` for SQLite's GLOB operator
fn to_sqlite_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '?' => glob.push_str("[?]"),
            '[' => glob.push_str("[[]"),
            other => glob.push(other),
        }
    }
    glob
}

#[async_trait]
impl CacheBackend for SqliteCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM cache_entries WHERE namespace = ? AND key = ? AND expires_at > ?",
        )
        .bind(namespace)
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((text,)) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_ms().saturating_add(ttl_ms);

        sqlx::query(
            r#"
            INSERT INTO cache_entries (namespace, key, value, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE (namespace || ':' || key) GLOB ?",
        )
        .bind(to_sqlite_glob(pattern))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
