//! MCP Error Handling
//!
//! Protocol-level failures and their JSON-RPC error representation. Failures of
//! the tools themselves are not errors here; they become `isError` tool results.

use crate::mcp::protocol::*;
use thiserror::Error;
use tracing::{error, warn};

/// MCP-specific errors that can occur during server operation
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("Invalid parameters for tool '{tool}': {message}")]
    InvalidToolParameters { tool: String, message: String },

    #[error("Invalid parameters: {message}")]
    InvalidParameters { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("JSON-RPC parse error: {message}")]
    ParseError { message: String },

    #[error("Internal server error: {message}")]
    InternalError { message: String },
}

impl McpError {
    /// Convert MCP error to JSON-RPC error
    #[inline]
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        let code = match self {
            Self::ToolNotFound { .. } => mcp_error_codes::TOOL_NOT_FOUND,
            Self::InvalidToolParameters { .. } | Self::InvalidParameters { .. } => {
                error_codes::INVALID_PARAMS
            }
            Self::InvalidRequest { .. } => error_codes::INVALID_REQUEST,
            Self::MethodNotFound { .. } => error_codes::METHOD_NOT_FOUND,
            Self::ParseError { .. } => error_codes::PARSE_ERROR,
            Self::InternalError { .. } => error_codes::INTERNAL_ERROR,
        };
        JsonRpcError::new(code, self.to_string(), None)
    }

    /// Create a complete JSON-RPC error response message
    #[inline]
    pub fn to_error_response(&self, id: Option<RequestId>) -> JsonRpcMessage {
        JsonRpcMessage::ErrorResponse(JsonRpcErrorResponse::new(self.to_jsonrpc_error(), id))
    }

    /// Log at a level matching who is at fault
    #[inline]
    pub fn log(&self) {
        match self {
            Self::InternalError { .. } => error!("MCP error: {}", self),
            _ => warn!("MCP request rejected: {}", self),
        }
    }
}

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

impl From<serde_json::Error> for McpError {
    #[inline]
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidParameters {
            message: error.to_string(),
        }
    }
}
