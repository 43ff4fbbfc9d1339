//! Gene and alias persistence

use chrono::Utc;
use kgdb_common::db::{parse_uuid, Gene};
use kgdb_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{fmt_ts, parse_json, parse_ts};

/// Result of an exact symbol/alias lookup
#[derive(Debug, Clone, PartialEq)]
pub enum AliasLookup {
    Unique(Gene),
    /// Several genes match; their symbols (or identifiers when the symbols
    /// themselves collide) for the attempt log
    Ambiguous(Vec<String>),
    NotFound,
}

const GENE_COLUMNS: &str = "id, hgnc_id, symbol, aliases, created_at, updated_at";

fn gene_from_row(row: &SqliteRow) -> Result<Gene> {
    let id: String = row.try_get("id")?;
    let aliases: String = row.try_get("aliases")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Gene {
        id: parse_uuid(&id)?,
        hgnc_id: row.try_get("hgnc_id")?,
        symbol: row.try_get("symbol")?,
        aliases: parse_json(&aliases, "genes.aliases")?,
        created_at: parse_ts(&created_at, "genes.created_at")?,
        updated_at: parse_ts(&updated_at, "genes.updated_at")?,
    })
}

/// Normalized form used for every symbol/alias comparison
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

pub async fn find_by_id(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Gene>> {
    let row = sqlx::query(&format!("SELECT {} FROM genes WHERE id = ?", GENE_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(gene_from_row).transpose()
}

pub async fn find_by_hgnc_id(conn: &mut SqliteConnection, hgnc_id: &str) -> Result<Option<Gene>> {
    let row = sqlx::query(&format!("SELECT {} FROM genes WHERE hgnc_id = ?", GENE_COLUMNS))
        .bind(hgnc_id.trim())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(gene_from_row).transpose()
}

/// Exact lookup of a cleaned mention: current symbols first, then aliases
pub async fn lookup_symbol(conn: &mut SqliteConnection, cleaned: &str) -> Result<AliasLookup> {
    let normalized = normalize_symbol(cleaned);

    let rows = sqlx::query(&format!(
        "SELECT {} FROM genes WHERE symbol = ? COLLATE NOCASE ORDER BY hgnc_id",
        GENE_COLUMNS
    ))
    .bind(&normalized)
    .fetch_all(&mut *conn)
    .await?;

    if rows.len() == 1 {
        return Ok(AliasLookup::Unique(gene_from_row(&rows[0])?));
    }
    if rows.len() > 1 {
        let genes = rows.iter().map(gene_from_row).collect::<Result<Vec<_>>>()?;
        return Ok(AliasLookup::Ambiguous(
            genes.into_iter().map(|g| g.hgnc_id).collect(),
        ));
    }

    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM genes
        WHERE id IN (SELECT gene_id FROM gene_aliases WHERE alias = ?)
        ORDER BY hgnc_id
        "#,
        GENE_COLUMNS
    ))
    .bind(&normalized)
    .fetch_all(&mut *conn)
    .await?;

    match rows.len() {
        0 => Ok(AliasLookup::NotFound),
        1 => Ok(AliasLookup::Unique(gene_from_row(&rows[0])?)),
        _ => {
            let genes = rows.iter().map(gene_from_row).collect::<Result<Vec<_>>>()?;
            Ok(AliasLookup::Ambiguous(
                genes.into_iter().map(|g| g.symbol).collect(),
            ))
        }
    }
}

/// Create the gene for `hgnc_id` or update its symbol, then attach `aliases`.
///
/// The symbol is stored in the case given; aliases are stored normalized.
/// Returns the stored gene and whether it was newly created. The UNIQUE
/// constraint on `hgnc_id` makes a concurrent duplicate insert impossible;
/// the conflict branch turns it into an update of the existing row.
pub async fn upsert_gene(
    conn: &mut SqliteConnection,
    hgnc_id: &str,
    symbol: &str,
    aliases: &[String],
) -> Result<(Gene, bool)> {
    let hgnc_id = hgnc_id.trim();
    let symbol = symbol.trim().to_string();
    let existing = find_by_hgnc_id(conn, hgnc_id).await?;
    let now = fmt_ts(&Utc::now());

    sqlx::query(
        r#"
        INSERT INTO genes (id, hgnc_id, symbol, aliases, created_at, updated_at)
        VALUES (?, ?, ?, '[]', ?, ?)
        ON CONFLICT(hgnc_id) DO UPDATE SET
            symbol = excluded.symbol,
            updated_at = excluded.updated_at
        WHERE genes.symbol != excluded.symbol
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(hgnc_id)
    .bind(&symbol)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    let mut all_aliases: Vec<String> = aliases.to_vec();
    if let Some(previous) = &existing {
        if !previous.symbol.eq_ignore_ascii_case(&symbol) {
            // A renamed gene stays findable under its previous symbol
            all_aliases.push(previous.symbol.clone());
            tracing::info!(
                hgnc_id,
                old_symbol = %previous.symbol,
                new_symbol = %symbol,
                "Gene symbol changed"
            );
        }
    }

    let gene = find_by_hgnc_id(conn, hgnc_id)
        .await?
        .ok_or_else(|| Error::Internal(format!("Gene {} vanished after upsert", hgnc_id)))?;

    let gene = add_aliases(conn, &gene, &all_aliases).await?;
    Ok((gene, existing.is_none()))
}

/// Attach aliases to a gene and refresh its denormalized alias list
pub async fn add_aliases(conn: &mut SqliteConnection, gene: &Gene, aliases: &[String]) -> Result<Gene> {
    let mut inserted = 0;
    for alias in aliases {
        let alias = normalize_symbol(alias);
        if alias.is_empty() || alias == gene.symbol {
            continue;
        }
        let result = sqlx::query("INSERT OR IGNORE INTO gene_aliases (alias, gene_id) VALUES (?, ?)")
            .bind(&alias)
            .bind(gene.id.to_string())
            .execute(&mut *conn)
            .await?;
        inserted += result.rows_affected();
    }

    if inserted == 0 {
        return Ok(gene.clone());
    }

    let all: Vec<String> = sqlx::query_scalar(
        "SELECT alias FROM gene_aliases WHERE gene_id = ? ORDER BY alias",
    )
    .bind(gene.id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let now = Utc::now();
    sqlx::query("UPDATE genes SET aliases = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(&all)?)
        .bind(fmt_ts(&now))
        .bind(gene.id.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(Gene {
        aliases: all,
        updated_at: now,
        ..gene.clone()
    })
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Gene>> {
    let mut conn = pool.acquire().await?;
    find_by_id(&mut conn, id).await
}

/// Every gene, ordered by id
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Gene>> {
    let rows = sqlx::query(&format!("SELECT {} FROM genes ORDER BY id", GENE_COLUMNS))
        .fetch_all(pool)
        .await?;
    rows.iter().map(gene_from_row).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM genes")
        .fetch_one(pool)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgdb_common::db::init_database;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_database(&dir.path().join("kgdb.db")).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_upsert_creates_once_per_identifier() {
        let (_dir, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let (first, created) = upsert_gene(&mut conn, "HGNC:9008", "pkd1", &["PBP".to_string()])
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.symbol, "PKD1");
        assert_eq!(first.aliases, vec!["PBP"]);

        let (second, created) = upsert_gene(&mut conn, "HGNC:9008", "PKD1", &[]).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_renamed_symbol_becomes_alias() {
        let (_dir, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        upsert_gene(&mut conn, "HGNC:1", "C9ORF72", &[]).await.unwrap();
        let (renamed, _) = upsert_gene(&mut conn, "HGNC:1", "NEW72", &[]).await.unwrap();
        assert_eq!(renamed.symbol, "NEW72");

        match lookup_symbol(&mut conn, "c9orf72").await.unwrap() {
            AliasLookup::Unique(gene) => assert_eq!(gene.id, renamed.id),
            other => panic!("expected unique match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shared_alias_is_ambiguous() {
        let (_dir, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        upsert_gene(&mut conn, "HGNC:1", "AAA1", &["SHARED".to_string()]).await.unwrap();
        upsert_gene(&mut conn, "HGNC:2", "BBB2", &["SHARED".to_string()]).await.unwrap();

        assert_eq!(
            lookup_symbol(&mut conn, "shared").await.unwrap(),
            AliasLookup::Ambiguous(vec!["AAA1".to_string(), "BBB2".to_string()])
        );
        assert_eq!(lookup_symbol(&mut conn, "ZZZ9").await.unwrap(), AliasLookup::NotFound);
    }
}
