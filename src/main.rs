//! Guarded SQL MCP Server - Main entry point.
//!
//! This server provides MCP (Model Context Protocol) tools for AI assistants
//! to run SQL against one database (SQLite, PostgreSQL, MySQL) under a
//! configurable security tier.

use clap::Parser;
use guarded_sql_mcp::config::{Config, TransportMode};
use guarded_sql_mcp::db::{ConnectionManager, StreamingExecutor};
use guarded_sql_mcp::tools::QueryToolHandler;
use guarded_sql_mcp::transport::{HttpTransport, StdioTransport, Transport};
use guarded_sql_mcp::validator::TierConfigCell;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; stdout belongs to the stdio transport.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    if let Err(message) = config.validate() {
        eprintln!("Error: {}", message);
        eprintln!();
        eprintln!("Usage: guarded-sql-mcp --database <connection_string>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  guarded-sql-mcp --database sqlite:data.db");
        eprintln!("  guarded-sql-mcp --database postgres://localhost/app --user app --password secret");
        eprintln!("  guarded-sql-mcp --database mysql://localhost/sales --read-only false --allow-destructive");
        std::process::exit(1);
    }

    let tiers = config.tier_config();
    let dialect = config.sql_dialect();
    info!(
        transport = %config.transport,
        read_only = tiers.read_only,
        allow_destructive = tiers.allow_destructive,
        allow_schema_changes = tiers.allow_schema_changes,
        dialect = ?dialect,
        "Starting Guarded SQL MCP Server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let connection_manager = Arc::new(ConnectionManager::new(config.connection_config()));
    let handler = QueryToolHandler::new(
        Arc::new(TierConfigCell::new(tiers)),
        dialect,
        connection_manager.clone(),
        StreamingExecutor::new(config.executor_settings()),
    );

    // Warm the pool; queries retry on their own if this fails
    if let Err(e) = connection_manager.connect().await {
        warn!(error = %e, "Initial connection failed; will retry on first query");
    }

    let result = match config.transport {
        TransportMode::Stdio => {
            info!("Using stdio transport");
            StdioTransport::new(handler).run().await
        }
        TransportMode::Http => {
            info!(
                host = %config.http_host,
                port = config.http_port,
                endpoint = %config.mcp_endpoint,
                "Using HTTP transport"
            );
            HttpTransport::new(
                handler,
                &config.http_host,
                config.http_port,
                &config.mcp_endpoint,
            )
            .run()
            .await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
