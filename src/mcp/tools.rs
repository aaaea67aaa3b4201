//! MCP Tools Implementation
//!
//! The two tools offered to clients: schema lookup for a natural-language
//! question and direct SQL execution. Both are thin wrappers over `QueryService`.

use crate::mcp::errors::{McpError, McpResult};
use crate::mcp::protocol::*;
use crate::mcp::server::{McpServer, ToolHandler};
use crate::query::QueryService;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

pub const GET_CAN_USE_TABLE: &str = "get_can_use_table";
pub const EXECUTE_SQL: &str = "execute_sql";

/// Schema lookup tool handler
pub struct TableLookupHandler {
    service: QueryService,
}

/// SQL execution tool handler
pub struct ExecuteSqlHandler {
    service: QueryService,
}

impl TableLookupHandler {
    #[inline]
    pub fn new(service: QueryService) -> Self {
        Self { service }
    }

    /// Create the get_can_use_table tool definition
    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: GET_CAN_USE_TABLE.to_string(),
            description: Some(
                "Find the database tables most relevant to a question and return their CREATE TABLE statements"
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural-language description of the data you need"
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for TableLookupHandler {
    #[inline]
    async fn handle(&self, params: CallToolParams) -> McpResult<CallToolResult> {
        let query = required_query(GET_CAN_USE_TABLE, &params)?;
        debug!("Looking up tables for: '{}'", query);

        match self.service.find_relevant_tables(&query).await {
            Ok(schemas) => Ok(CallToolResult::text(schemas)),
            Err(e) => {
                warn!("Table lookup failed: {}", e);
                Ok(CallToolResult::error(format!("Table lookup failed: {e}")))
            }
        }
    }
}

impl ExecuteSqlHandler {
    #[inline]
    pub fn new(service: QueryService) -> Self {
        Self { service }
    }

    /// Create the execute_sql tool definition
    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: EXECUTE_SQL.to_string(),
            description: Some(
                "Execute a SQL statement. SELECT, SHOW, DESCRIBE and EXPLAIN return the rows as a JSON array; other statements report the affected row count"
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "SQL statement to execute"
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for ExecuteSqlHandler {
    #[inline]
    async fn handle(&self, params: CallToolParams) -> McpResult<CallToolResult> {
        let statement = required_query(EXECUTE_SQL, &params)?;
        debug!("Executing SQL: '{}'", statement);

        match self.service.execute_sql(&statement).await {
            Ok(output) => Ok(CallToolResult::text(output)),
            Err(e) => {
                warn!("SQL execution failed: {}", e);
                Ok(CallToolResult::error(format!("SQL execution failed: {e}")))
            }
        }
    }
}

/// Register both tools on `server`
#[inline]
pub async fn register_query_tools(server: &McpServer, service: QueryService) {
    server
        .register_tool(
            TableLookupHandler::tool_definition(),
            TableLookupHandler::new(service.clone()),
        )
        .await;
    server
        .register_tool(
            ExecuteSqlHandler::tool_definition(),
            ExecuteSqlHandler::new(service),
        )
        .await;
}

fn required_query(tool: &str, params: &CallToolParams) -> McpResult<String> {
    let query = params
        .arguments
        .as_ref()
        .and_then(|args| args.get("query"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| McpError::InvalidToolParameters {
            tool: tool.to_string(),
            message: "missing required string argument 'query'".to_string(),
        })?;

    if query.trim().is_empty() {
        return Err(McpError::InvalidToolParameters {
            tool: tool.to_string(),
            message: "'query' cannot be blank".to_string(),
        });
    }
    Ok(query.to_string())
}
