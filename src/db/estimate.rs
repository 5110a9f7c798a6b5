//! Catalog-based table size estimates.
//!
//! Estimates feed the streaming decision only. Any failure (bad identifier,
//! missing table, permission error, timeout) is logged and reported as
//! `None`, which turns the size trigger off for that query.

use crate::db::pool::DbPool;
use regex::Regex;
use serde::Serialize;
use sqlx::Row;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Approximate size of a table according to the backend's catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableEstimate {
    pub rows: u64,
    /// Not every backend reports storage size cheaply.
    pub bytes: Option<u64>,
}

/// `table` or `schema.table`, plain identifiers only.
static TABLE_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(?:\.[A-Za-z_][A-Za-z0-9_$]*)?$")
        .expect("constant pattern")
});

mod queries {
    pub mod postgres {
        pub const TABLE_ESTIMATE: &str = r#"
            SELECT GREATEST(c.reltuples, 0)::BIGINT AS row_estimate,
                   pg_total_relation_size(c.oid) AS size_bytes
            FROM pg_class c
            WHERE c.oid = $1::regclass
        "#;
    }

    pub mod mysql {
        pub const TABLE_ESTIMATE: &str = r#"
            SELECT CAST(TABLE_ROWS AS UNSIGNED) AS row_estimate,
                   CAST(DATA_LENGTH + INDEX_LENGTH AS UNSIGNED) AS size_bytes
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
        "#;
    }
}

/// Split a validated `schema.table` reference.
fn split_table(table: &str) -> Option<(Option<&str>, &str)> {
    if !TABLE_IDENT.is_match(table) {
        return None;
    }
    Some(match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    })
}

/// Estimate the size of `table`, bounded by `timeout`.
pub async fn estimate_table(
    pool: &DbPool,
    table: &str,
    timeout: Duration,
) -> Option<TableEstimate> {
    let Some((schema, name)) = split_table(table) else {
        warn!(table, "Ignoring size estimate for malformed table name");
        return None;
    };

    let lookup = async {
        match pool {
            DbPool::Postgres(p) => {
                let row = sqlx::query(queries::postgres::TABLE_ESTIMATE)
                    .bind(table)
                    .fetch_one(p)
                    .await?;
                let rows: i64 = row.try_get("row_estimate")?;
                let bytes: i64 = row.try_get("size_bytes")?;
                Ok::<_, sqlx::Error>(TableEstimate {
                    rows: u64::try_from(rows).unwrap_or(0),
                    bytes: u64::try_from(bytes).ok(),
                })
            }
            DbPool::MySql(p) => {
                let row = sqlx::query(queries::mysql::TABLE_ESTIMATE)
                    .bind(schema)
                    .bind(name)
                    .fetch_one(p)
                    .await?;
                let rows: Option<u64> = row.try_get("row_estimate")?;
                let bytes: Option<u64> = row.try_get("size_bytes")?;
                Ok(TableEstimate {
                    rows: rows.unwrap_or(0),
                    bytes,
                })
            }
            DbPool::SQLite(p) => {
                let sql = match schema {
                    Some(schema) => format!("SELECT COUNT(*) FROM \"{}\".\"{}\"", schema, name),
                    None => format!("SELECT COUNT(*) FROM \"{}\"", name),
                };
                let count: i64 = sqlx::query_scalar(&sql).fetch_one(p).await?;
                Ok(TableEstimate {
                    rows: u64::try_from(count).unwrap_or(0),
                    bytes: None,
                })
            }
        }
    };

    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(estimate)) => {
            debug!(table, rows = estimate.rows, bytes = ?estimate.bytes, "Table size estimate");
            Some(estimate)
        }
        Ok(Err(e)) => {
            warn!(table, error = %e, "Table size estimate failed");
            None
        }
        Err(_) => {
            warn!(table, timeout_secs = timeout.as_secs(), "Table size estimate timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn test_split_table() {
        assert_eq!(split_table("users"), Some((None, "users")));
        assert_eq!(split_table("public.users"), Some((Some("public"), "users")));
        assert_eq!(split_table("users; DROP TABLE x"), None);
        assert_eq!(split_table("a.b.c"), None);
        assert_eq!(split_table("\"quoted\""), None);
    }

    #[tokio::test]
    async fn test_sqlite_count_estimate() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO items VALUES (1), (2), (3)")
            .execute(&pool)
            .await
            .unwrap();

        let db = DbPool::SQLite(pool);
        let estimate = estimate_table(&db, "items", Duration::from_secs(5)).await;
        assert_eq!(estimate, Some(TableEstimate { rows: 3, bytes: None }));

        assert_eq!(estimate_table(&db, "missing", Duration::from_secs(5)).await, None);
        assert_eq!(estimate_table(&db, "bad name", Duration::from_secs(5)).await, None);
    }
}
