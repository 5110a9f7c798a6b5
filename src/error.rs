//! Error types for the guarded SQL pipeline.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Each variant carries actionable text so that an AI assistant can understand
//! why a request failed and what to change before retrying.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// The validator refused the statement. Expected behaviour, not a bug.
    #[error("Statement rejected{}: {reason}", position_suffix(*statement_index, *total_statements))]
    PolicyRejection {
        reason: String,
        statement_index: Option<u32>,
        total_statements: Option<u32>,
        security_violation: bool,
    },

    /// A single connection attempt failed. Retried by the connection manager.
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// Every connection attempt failed; terminal for this invocation.
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    /// The row source failed after streaming had started.
    #[error(
        "Stream aborted after {chunks_completed} complete chunks ({rows_streamed} rows): {message}. The export is incomplete and must not be used."
    )]
    StreamAborted {
        chunks_completed: u32,
        rows_streamed: u64,
        message: String,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn position_suffix(index: Option<u32>, total: Option<u32>) -> String {
    match (index, total) {
        (Some(i), Some(t)) => format!(" (statement {} of {})", i, t),
        _ => String::new(),
    }
}

impl DbError {
    /// Create a policy rejection error.
    pub fn policy_rejection(
        reason: impl Into<String>,
        statement_index: Option<u32>,
        total_statements: Option<u32>,
        security_violation: bool,
    ) -> Self {
        Self::PolicyRejection {
            reason: reason.into(),
            statement_index,
            total_statements,
            security_violation,
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create the terminal error raised once the retry budget is spent.
    pub fn connection_exhausted(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::ConnectionExhausted {
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Create a stream-aborted error.
    pub fn stream_aborted(
        chunks_completed: u32,
        rows_streamed: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::StreamAborted {
            chunks_completed,
            rows_streamed,
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::ConnectionExhausted { .. } => {
                Some("Check that the database server is reachable and the credentials are valid")
            }
            Self::StreamAborted { .. } => {
                Some("Discard the partial chunks and re-run the query")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error was raised by the security scans rather than tier policy.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::PolicyRejection {
                security_violation: true,
                ..
            }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DbError::invalid_input(format!("Invalid connection settings: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out waiting for a pooled connection",
                "Raise --pool-max or --connect-timeout, or reduce concurrent queries",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration or the trust-server-certificate setting",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Build suggestion data as JSON value.
fn suggestion_data(suggestion: Option<&str>) -> Option<serde_json::Value> {
    suggestion.map(|s| serde_json::json!({ "suggestion": s }))
}

/// Convert DbError to MCP ErrorData for semantic error categorization.
/// Includes the suggestion field in the `data` object when available.
impl From<DbError> for rmcp::ErrorData {
    fn from(err: DbError) -> Self {
        match &err {
            DbError::PolicyRejection {
                statement_index,
                total_statements,
                security_violation,
                ..
            } => rmcp::ErrorData::invalid_params(
                err.to_string(),
                Some(serde_json::json!({
                    "statement_index": statement_index,
                    "total_statements": total_statements,
                    "security_violation": security_violation,
                })),
            ),
            DbError::InvalidInput { .. } | DbError::Schema { .. } => {
                rmcp::ErrorData::invalid_params(err.to_string(), suggestion_data(err.suggestion()))
            }

            DbError::Database {
                message,
                sql_state,
                suggestion,
            } => {
                let msg = match sql_state {
                    Some(code) => format!("{} (SQLSTATE: {})", message, code),
                    None => message.clone(),
                };
                rmcp::ErrorData::invalid_params(msg, suggestion_data(Some(suggestion)))
            }

            DbError::Timeout { .. } => rmcp::ErrorData::internal_error(
                err.to_string(),
                suggestion_data(Some(
                    "Consider increasing the timeout or narrowing the query",
                )),
            ),

            DbError::Connection { .. }
            | DbError::ConnectionExhausted { .. }
            | DbError::StreamAborted { .. }
            | DbError::Internal { .. } => {
                rmcp::ErrorData::internal_error(err.to_string(), suggestion_data(err.suggestion()))
            }
        }
    }
}
