//! MCP service implementation using rmcp.
//!
//! This module defines the DbService struct with the SQL tools exposed via
//! the MCP protocol using the rmcp framework's macros.

use crate::models::HealthSnapshot;
use crate::tools::query::{QueryInput, QueryOutput, QueryToolHandler, ValidateSqlInput};
use crate::validator::ValidationVerdict;
use rmcp::Json;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};

#[derive(Clone)]
pub struct DbService {
    /// Shared query pipeline (tier config, connection manager, executor)
    handler: QueryToolHandler,
    /// Tool router for MCP tool dispatch (auto-generated)
    tool_router: ToolRouter<Self>,
}

impl DbService {
    pub fn new(handler: QueryToolHandler) -> Self {
        Self {
            handler,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl DbService {
    #[tool(
        description = "Execute SQL against the configured database.\nThe SQL is checked against the server's security tiers first; rejected SQL never reaches the database.\nResults are returned buffered, or as ordered chunks for large or bulk reads (force with force_stream).\nOutput format: json (default), csv, or rows."
    )]
    async fn query(
        &self,
        Parameters(input): Parameters<QueryInput>,
    ) -> Result<Json<QueryOutput>, McpError> {
        self.handler
            .query(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Check whether SQL would be allowed, without executing it.\nReturns the verdict, the statement kind, and for rejections the 1-based index of the offending statement."
    )]
    async fn validate_sql(
        &self,
        Parameters(input): Parameters<ValidateSqlInput>,
    ) -> Json<ValidationVerdict> {
        Json(self.handler.validate_sql(input))
    }

    #[tool(
        description = "Report connection state and pool occupancy (size, available, pending, borrowed). Does not contact the database."
    )]
    async fn health(&self) -> Json<HealthSnapshot> {
        Json(self.handler.health())
    }
}

#[tool_handler]
impl ServerHandler for DbService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "guarded-sql-mcp".to_owned(),
                title: Some("Guarded SQL MCP Server".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "SQL tools for a single database behind a tiered safety policy.\n\
                \n\
                ## Workflow\n\
                1. Optionally call `validate_sql` to see whether SQL is allowed\n\
                2. Call `query` to run it\n\
                3. Call `health` if connections fail\n\
                \n\
                ## Security tiers\n\
                - **Read-only** (default): SELECT, SHOW, EXPLAIN and similar only\n\
                - **Destructive**: INSERT, UPDATE, DELETE, MERGE, TRUNCATE when enabled\n\
                - **Schema change**: CREATE, ALTER, DROP, GRANT when enabled\n\
                \n\
                Calls to file, shell, network or extended-procedure routines are never allowed.\n\
                A write that follows a read in the same request is rejected; send statements separately.\n\
                \n\
                ## Large results\n\
                `SELECT *` without LIMIT, bulk/export keywords, or a large `table` estimate switch\n\
                the result to ordered chunks. Concatenating chunk payloads gives the full export."
                    .to_string(),
            ),
        }
    }
}
