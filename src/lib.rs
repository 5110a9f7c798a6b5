//! Guarded SQL MCP Server Library
//!
//! This library runs SQL for AI assistants behind a tiered safety policy:
//! requests are validated before any database I/O, connections are acquired
//! with retry and backoff, and results are delivered buffered or as ordered
//! chunks (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod mcp;
pub mod models;
pub mod tools;
pub mod transport;
pub mod validator;

pub use config::Config;
pub use error::DbError;
pub use mcp::DbService;
