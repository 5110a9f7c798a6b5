//! MCP tool implementations.
//!
//! - `query`: validate, connect and execute SQL
//! - `validate_sql`: dry-run validation, no database I/O
//! - `health`: connection manager snapshot

pub mod query;

pub use query::{QueryInput, QueryOutput, QueryToolHandler, ValidateSqlInput};
