//! End-to-end tests through the query tool handler.
//!
//! Validation must happen before any connection attempt, allowed queries
//! run through the executor, and tier changes apply to the next request.

use async_trait::async_trait;
use guarded_sql_mcp::config::PoolOptions;
use guarded_sql_mcp::db::{ConnectionManager, Connector, DbPool, Sleeper, StreamingExecutor};
use guarded_sql_mcp::error::{DbError, DbResult};
use guarded_sql_mcp::models::{ChunkFormat, ConnectionConfig, ConnectionDescriptor};
use guarded_sql_mcp::tools::{QueryInput, QueryToolHandler, ValidateSqlInput};
use guarded_sql_mcp::validator::{SecurityTierConfig, SqlDialect, StatementKind, TierConfigCell};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Hands out one shared in-memory SQLite pool and counts calls.
struct CountingConnector {
    pool: DbPool,
    calls: AtomicU32,
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        _pool_options: &PoolOptions,
    ) -> DbResult<DbPool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pool.clone())
    }
}

struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

struct Fixture {
    handler: QueryToolHandler,
    tiers: Arc<TierConfigCell>,
    connector: Arc<CountingConnector>,
}

impl Fixture {
    async fn new(tiers: SecurityTierConfig) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO users (id, name) VALUES (1, 'alice'), (2, 'bob, jr')")
            .execute(&pool)
            .await
            .unwrap();

        let connector = Arc::new(CountingConnector {
            pool: DbPool::SQLite(pool),
            calls: AtomicU32::new(0),
        });
        let manager = Arc::new(ConnectionManager::with_connector(
            ConnectionConfig::new("sqlite::memory:"),
            connector.clone(),
            Arc::new(NoSleep),
        ));
        let tiers = Arc::new(TierConfigCell::new(tiers));
        let handler = QueryToolHandler::new(
            tiers.clone(),
            SqlDialect::Sqlite,
            manager,
            StreamingExecutor::default(),
        );
        Self {
            handler,
            tiers,
            connector,
        }
    }

    fn connect_calls(&self) -> u32 {
        self.connector.calls.load(Ordering::SeqCst)
    }
}

/// A rejected request never reaches the connection manager.
#[tokio::test]
async fn test_rejection_makes_no_connection_attempt() {
    let fixture = Fixture::new(SecurityTierConfig::read_only()).await;

    for sql in [
        "DELETE FROM users",
        "SELECT * FROM users; DROP TABLE users",
        "EXEC xp_cmdshell('dir')",
    ] {
        let err = fixture.handler.query(QueryInput::new(sql)).await.unwrap_err();
        assert!(matches!(err, DbError::PolicyRejection { .. }), "{}", sql);
    }
    assert_eq!(fixture.connect_calls(), 0);
    assert!(!fixture.handler.health().connected);
}

#[tokio::test]
async fn test_rejection_carries_statement_position() {
    let fixture = Fixture::new(SecurityTierConfig::read_only()).await;
    let err = fixture
        .handler
        .query(QueryInput::new("SELECT 1; DROP TABLE users"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("statement 2 of 2"), "{}", err);
    match err {
        DbError::PolicyRejection {
            statement_index,
            total_statements,
            ..
        } => {
            assert_eq!(statement_index, Some(2));
            assert_eq!(total_statements, Some(2));
        }
        other => panic!("expected PolicyRejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_allowed_query_runs_end_to_end() {
    let fixture = Fixture::new(SecurityTierConfig::read_only()).await;
    let input = QueryInput {
        format: ChunkFormat::Csv,
        ..QueryInput::new("SELECT id, name FROM users ORDER BY id")
    };

    let output = fixture.handler.query(input).await.unwrap();

    assert_eq!(output.statement_kind, StatementKind::ReadOnly);
    assert!(!output.used_fallback);
    assert!(output.streamed.is_none());
    let buffered = output.buffered.unwrap();
    assert_eq!(buffered.row_count, 2);
    assert_eq!(buffered.export, "id,name\n1,alice\n2,\"bob, jr\"\n");
    assert_eq!(fixture.connect_calls(), 1);
    assert!(fixture.handler.health().connected);
}

#[tokio::test]
async fn test_forced_stream_through_handler() {
    let fixture = Fixture::new(SecurityTierConfig::read_only()).await;
    let input = QueryInput {
        force_stream: true,
        ..QueryInput::new("SELECT id FROM users ORDER BY id")
    };

    let output = fixture.handler.query(input).await.unwrap();

    assert!(output.buffered.is_none());
    let streamed = output.streamed.unwrap();
    assert_eq!(streamed.stats.total_rows, 2);
    assert_eq!(
        String::from_utf8(streamed.reconstruct()).unwrap(),
        r#"[{"id":1},{"id":2}]"#
    );
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let fixture = Fixture::new(SecurityTierConfig::read_only()).await;
    let a = fixture.handler.query(QueryInput::new("SELECT 1")).await.unwrap();
    let b = fixture.handler.query(QueryInput::new("SELECT 1")).await.unwrap();
    assert_ne!(a.request_id, b.request_id);
    assert_eq!(fixture.connect_calls(), 1);
}

/// Replacing the tier config applies to the next request.
#[tokio::test]
async fn test_tier_change_applies_to_next_request() {
    let fixture = Fixture::new(SecurityTierConfig::read_only()).await;
    let insert = "INSERT INTO users (id, name) VALUES (3, 'carol')";

    assert!(fixture.handler.query(QueryInput::new(insert)).await.is_err());

    fixture.tiers.replace(SecurityTierConfig {
        read_only: false,
        allow_destructive: true,
        allow_schema_changes: false,
    });
    let output = fixture.handler.query(QueryInput::new(insert)).await.unwrap();
    assert_eq!(output.statement_kind, StatementKind::Destructive);

    let count = fixture
        .handler
        .query(QueryInput::new("SELECT COUNT(*) AS n FROM users"))
        .await
        .unwrap();
    assert_eq!(count.buffered.unwrap().export, r#"[{"n":3}]"#);
}

#[tokio::test]
async fn test_validate_sql_never_connects() {
    let fixture = Fixture::new(SecurityTierConfig::read_only()).await;
    let verdict = fixture.handler.validate_sql(ValidateSqlInput {
        sql: "SELECT * FROM users".to_string(),
    });
    assert!(verdict.allowed);
    assert_eq!(fixture.connect_calls(), 0);
}
