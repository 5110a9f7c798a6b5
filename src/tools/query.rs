//! Query tool: validate, connect, execute.
//!
//! This is the only place the validator, the connection manager and the
//! executor meet. A rejected query never reaches the connection manager.

use crate::db::{ConnectionManager, StreamingExecutor};
use crate::error::DbResult;
use crate::models::{
    BufferedResult, ChunkFormat, ExecutionOutcome, HealthSnapshot, RunOptions, StreamedResult,
};
use crate::validator::{self, SqlDialect, StatementKind, TierConfigCell, ValidationVerdict};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

/// Default value for decode_binary field.
fn default_decode_binary() -> bool {
    true
}

/// Input for the query tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct QueryInput {
    /// SQL to run. Checked against the configured security tiers before any database I/O.
    pub sql: String,
    /// Result serialization: "json" (default) array of row objects, "csv", or "rows" (one JSON array per line)
    #[serde(default)]
    pub format: ChunkFormat,
    /// Deliver the result as ordered chunks even if it looks small
    #[serde(default)]
    pub force_stream: bool,
    /// Table the query reads from. Enables a catalog size estimate for the streaming decision.
    #[serde(default)]
    pub table: Option<String>,
    /// If true (default), try to decode binary columns as UTF-8 text first (fallback to base64). If false, always use base64 encoding.
    #[serde(default = "default_decode_binary")]
    pub decode_binary: bool,
}

impl QueryInput {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            format: ChunkFormat::default(),
            force_stream: false,
            table: None,
            decode_binary: true,
        }
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            format: self.format,
            force_stream: self.force_stream,
            table: self.table.clone(),
            decode_binary: self.decode_binary,
        }
    }
}

/// Output from the query tool. Exactly one of `buffered` and `streamed` is set.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct QueryOutput {
    pub request_id: String,
    /// Most privileged statement kind in the request
    pub statement_kind: StatementKind,
    /// Validation used keyword heuristics because the SQL did not parse
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffered: Option<BufferedResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streamed: Option<StreamedResult>,
}

impl QueryOutput {
    fn new(request_id: String, verdict: &ValidationVerdict, outcome: ExecutionOutcome) -> Self {
        let (buffered, streamed) = match outcome {
            ExecutionOutcome::Buffered(result) => (Some(result), None),
            ExecutionOutcome::Streamed(result) => (None, Some(result)),
        };
        Self {
            request_id,
            statement_kind: verdict.statement_kind,
            used_fallback: verdict.used_fallback,
            buffered,
            streamed,
        }
    }
}

/// Input for the validate_sql tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ValidateSqlInput {
    /// SQL to check. Nothing is executed.
    pub sql: String,
}

/// Handler for query execution.
#[derive(Debug, Clone)]
pub struct QueryToolHandler {
    tiers: Arc<TierConfigCell>,
    dialect: SqlDialect,
    connection_manager: Arc<ConnectionManager>,
    executor: StreamingExecutor,
}

impl QueryToolHandler {
    pub fn new(
        tiers: Arc<TierConfigCell>,
        dialect: SqlDialect,
        connection_manager: Arc<ConnectionManager>,
        executor: StreamingExecutor,
    ) -> Self {
        Self {
            tiers,
            dialect,
            connection_manager,
            executor,
        }
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    /// Check `sql` against the current tier snapshot.
    pub fn validate_sql(&self, input: ValidateSqlInput) -> ValidationVerdict {
        let tiers = self.tiers.snapshot();
        validator::validate(&input.sql, &tiers, self.dialect)
    }

    /// Handle the query tool call.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DbError::PolicyRejection`] without touching
    /// the database when validation fails; otherwise connection and
    /// execution errors propagate unchanged.
    pub async fn query(&self, input: QueryInput) -> DbResult<QueryOutput> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("query", request_id = %request_id);
        self.run_query(request_id, input).instrument(span).await
    }

    async fn run_query(&self, request_id: String, input: QueryInput) -> DbResult<QueryOutput> {
        let tiers = self.tiers.snapshot();
        let verdict = validator::validate(&input.sql, &tiers, self.dialect).into_result()?;

        let pool = self.connection_manager.connect().await?;
        let outcome = self
            .executor
            .run(&pool, &input.sql, &input.run_options())
            .await?;

        info!(
            kind = %verdict.statement_kind,
            rows = outcome.row_count(),
            streamed = outcome.decision().stream,
            "Query executed"
        );

        Ok(QueryOutput::new(request_id, &verdict, outcome))
    }

    pub fn health(&self) -> HealthSnapshot {
        self.connection_manager.health()
    }
}
