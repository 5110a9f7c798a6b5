//! Configuration handling for the guarded SQL server.
//!
//! Every knob is a CLI flag with an `MCP_*` environment variable fallback.
//! The parsed [`Config`] is split into the smaller structs each component
//! consumes (tier policy, connection settings, executor settings).

use crate::db::ExecutorSettings;
use crate::models::{ConnectionConfig, DatabaseType};
use crate::validator::{SecurityTierConfig, SqlDialect};
use clap::{Parser, ValueEnum};
use std::time::Duration;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_MCP_ENDPOINT: &str = "/";
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_DOMAIN: &str = "WORKGROUP";
pub const DEFAULT_ENVIRONMENT: &str = "production";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

// Streaming defaults
pub const DEFAULT_STREAM_BATCH_SIZE: usize = 1000;
pub const DEFAULT_STREAM_MAX_MEMORY_MB: u64 = 100;

/// Connection pool bounds.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10, or 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections kept open (default: 0)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 30)
    pub idle_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("pool max must be greater than 0".to_string());
        }
        if let (Some(min), Some(max)) = (self.min_connections, self.max_connections) {
            if min > max {
                return Err(format!("pool min ({}) cannot exceed pool max ({})", min, max));
            }
        }
        Ok(())
    }
}

/// Transport mode for the MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TransportMode {
    /// Standard input/output (for CLI integration)
    #[default]
    Stdio,
    /// Streamable HTTP (for web clients)
    Http,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Configuration for the guarded SQL server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "guarded-sql-mcp",
    about = "MCP server that runs SQL behind a tiered safety policy",
    version,
    author
)]
pub struct Config {
    /// Database connection URL (postgres://, mysql://, sqlite:)
    #[arg(short = 'd', long = "database", value_name = "URL", env = "MCP_DATABASE")]
    pub database: String,

    /// Login principal. Omit together with --password for integrated authentication.
    #[arg(long = "user", env = "MCP_DB_USER")]
    pub user: Option<String>,

    /// Login credential
    #[arg(long = "password", env = "MCP_DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Domain used for integrated authentication
    #[arg(long, default_value = DEFAULT_DOMAIN, env = "MCP_DB_DOMAIN")]
    pub domain: String,

    /// Trust the server certificate without verification. Unset means environment heuristic.
    #[arg(long, env = "MCP_TRUST_SERVER_CERTIFICATE")]
    pub trust_server_certificate: Option<bool>,

    /// Deployment environment name (development, test, staging, production)
    #[arg(long, default_value = DEFAULT_ENVIRONMENT, env = "MCP_ENVIRONMENT")]
    pub environment: String,

    /// SQL dialect for statement parsing. Defaults to the database backend.
    #[arg(long, value_enum, env = "MCP_SQL_DIALECT")]
    pub dialect: Option<SqlDialect>,

    /// Only permit read-only statements
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "MCP_READ_ONLY"
    )]
    pub read_only: bool,

    /// Permit INSERT/UPDATE/DELETE/TRUNCATE/EXEC when read-only mode is off
    #[arg(long, env = "MCP_ALLOW_DESTRUCTIVE")]
    pub allow_destructive: bool,

    /// Permit CREATE/ALTER/DROP/GRANT/REVOKE when read-only mode is off
    #[arg(long, env = "MCP_ALLOW_SCHEMA_CHANGES")]
    pub allow_schema_changes: bool,

    /// Per-attempt connection timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS,
        env = "MCP_CONNECT_TIMEOUT"
    )]
    pub connect_timeout: u64,

    /// Query timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_QUERY_TIMEOUT_SECS,
        env = "MCP_QUERY_TIMEOUT"
    )]
    pub query_timeout: u64,

    /// Connection acquisition attempts before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "MCP_MAX_RETRIES")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between attempts, in milliseconds
    #[arg(
        long,
        default_value_t = DEFAULT_RETRY_BASE_DELAY_MS,
        env = "MCP_RETRY_BASE_DELAY_MS"
    )]
    pub retry_base_delay_ms: u64,

    /// Minimum pooled connections
    #[arg(long, env = "MCP_POOL_MIN")]
    pub pool_min: Option<u32>,

    /// Maximum pooled connections (default: 10, or 1 for SQLite)
    #[arg(long, env = "MCP_POOL_MAX")]
    pub pool_max: Option<u32>,

    /// Idle connection eviction timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_IDLE_TIMEOUT_SECS,
        env = "MCP_POOL_IDLE_TIMEOUT"
    )]
    pub pool_idle_timeout: u64,

    /// Rows per streamed chunk
    #[arg(
        long,
        default_value_t = DEFAULT_STREAM_BATCH_SIZE,
        env = "MCP_STREAM_BATCH_SIZE"
    )]
    pub stream_batch_size: usize,

    /// Advisory ceiling for buffered results, in megabytes
    #[arg(
        long,
        default_value_t = DEFAULT_STREAM_MAX_MEMORY_MB,
        env = "MCP_STREAM_MAX_MEMORY_MB"
    )]
    pub stream_max_memory_mb: u64,

    /// Master switch for chunked delivery
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "MCP_ENABLE_STREAMING"
    )]
    pub enable_streaming: bool,

    /// Transport mode (stdio or http)
    #[arg(
        short,
        long,
        value_enum,
        default_value = "stdio",
        env = "MCP_TRANSPORT"
    )]
    pub transport: TransportMode,

    /// HTTP host to bind to (only used with http transport)
    #[arg(
        long,
        default_value = DEFAULT_HTTP_HOST,
        env = "MCP_HTTP_HOST"
    )]
    pub http_host: String,

    /// HTTP port to bind to (only used with http transport)
    #[arg(
        long,
        default_value_t = DEFAULT_HTTP_PORT,
        env = "MCP_HTTP_PORT"
    )]
    pub http_port: u16,

    /// MCP endpoint path (only used with http transport)
    #[arg(
        long,
        default_value = DEFAULT_MCP_ENDPOINT,
        env = "MCP_ENDPOINT"
    )]
    pub mcp_endpoint: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "MCP_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration for the given database (useful for testing).
    pub fn for_database(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: None,
            password: None,
            domain: DEFAULT_DOMAIN.to_string(),
            trust_server_certificate: None,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            dialect: None,
            read_only: true,
            allow_destructive: false,
            allow_schema_changes: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            pool_min: None,
            pool_max: None,
            pool_idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            stream_batch_size: DEFAULT_STREAM_BATCH_SIZE,
            stream_max_memory_mb: DEFAULT_STREAM_MAX_MEMORY_MB,
            enable_streaming: true,
            transport: TransportMode::Stdio,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            mcp_endpoint: DEFAULT_MCP_ENDPOINT.to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Check cross-field constraints clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if DatabaseType::from_connection_string(&self.database).is_none() {
            return Err(
                "Unrecognised database URL scheme. Use postgres://, mysql:// or sqlite:".to_string(),
            );
        }
        self.pool_options().validate()?;
        if self.max_retries == 0 {
            return Err("max retries must be at least 1".to_string());
        }
        if self.stream_batch_size == 0 {
            return Err("stream batch size must be at least 1".to_string());
        }
        Ok(())
    }

    /// Security tier derived from the three toggles.
    pub fn tier_config(&self) -> SecurityTierConfig {
        SecurityTierConfig {
            read_only: self.read_only,
            allow_destructive: self.allow_destructive,
            allow_schema_changes: self.allow_schema_changes,
        }
    }

    /// Dialect used by the validator: explicit override, else the backend's own.
    pub fn sql_dialect(&self) -> SqlDialect {
        self.dialect.unwrap_or_else(|| {
            DatabaseType::from_connection_string(&self.database)
                .map(SqlDialect::from)
                .unwrap_or(SqlDialect::Generic)
        })
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.pool_max,
            min_connections: self.pool_min,
            idle_timeout_secs: Some(self.pool_idle_timeout),
        }
    }

    /// Settings consumed by the connection manager.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connection_string: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            domain: self.domain.clone(),
            trust_server_certificate: self.trust_server_certificate,
            environment: self.environment.clone(),
            pool_options: self.pool_options(),
            connect_timeout: self.connect_timeout_duration(),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    /// Settings consumed by the streaming executor.
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            enable_streaming: self.enable_streaming,
            batch_size: self.stream_batch_size,
            max_memory_bytes: self.stream_max_memory_mb.saturating_mul(1024 * 1024),
            query_timeout: self.query_timeout_duration(),
            ..ExecutorSettings::default()
        }
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Get the query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Get the connection timeout as a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
