//! MCP Server Implementation
//!
//! Line-delimited JSON-RPC over any async reader/writer pair, with stdio as the
//! production transport. Requests are handled one at a time in arrival order.

use crate::mcp::errors::{McpError, McpResult};
use crate::mcp::protocol::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// MCP Server state and configuration
pub struct McpServer {
    /// Server implementation information
    pub server_info: Implementation,
    /// Server capabilities
    pub capabilities: ServerCapabilities,
    /// Registered tools, listed in name order
    pub tools: Arc<RwLock<BTreeMap<String, Tool>>>,
    /// Tool handlers
    pub tool_handlers: Arc<RwLock<BTreeMap<String, Arc<dyn ToolHandler>>>>,
    /// Connection state
    pub connection_state: Arc<RwLock<ConnectionState>>,
    /// Text returned to clients in the initialize result
    pub instructions: Option<String>,
}

/// Connection state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

/// Tool handler trait for implementing tool execution
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, params: CallToolParams) -> McpResult<CallToolResult>;
}

/// Message handler for processing incoming messages
pub struct MessageHandler {
    server: Arc<McpServer>,
}

impl McpServer {
    /// Create a new MCP server
    #[inline]
    pub fn new(name: String, version: String) -> Self {
        Self {
            server_info: Implementation { name, version },
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
            },
            tools: Arc::new(RwLock::new(BTreeMap::new())),
            tool_handlers: Arc::new(RwLock::new(BTreeMap::new())),
            connection_state: Arc::new(RwLock::new(ConnectionState::Uninitialized)),
            instructions: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a tool with the server
    #[inline]
    pub async fn register_tool<H>(&self, tool: Tool, handler: H)
    where
        H: ToolHandler + 'static,
    {
        let tool_name = tool.name.clone();

        {
            let mut tools = self.tools.write().await;
            tools.insert(tool_name.clone(), tool);
        }

        {
            let mut handlers = self.tool_handlers.write().await;
            handlers.insert(tool_name.clone(), Arc::new(handler));
        }

        debug!("Registered tool: {}", tool_name);
    }

    /// Start the server using stdio transport
    #[inline]
    pub async fn serve_stdio(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Starting MCP server with stdio transport");
        self.serve(io::stdin(), io::stdout(), cancel).await
    }

    /// Serve requests from `reader` until EOF, a read error, or cancellation
    #[inline]
    pub async fn serve<R, W>(
        self: Arc<Self>,
        reader: R,
        mut writer: W,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let handler = MessageHandler::new(Arc::clone(&self));

        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                read = reader.read_line(&mut line) => Some(read),
            };

            match read {
                None => {
                    info!("Shutdown requested, closing connection");
                    break;
                }
                Some(Ok(0)) => {
                    info!("EOF reached, closing connection");
                    break;
                }
                Some(Ok(_)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    if let Some(reply) = handler.process_line(line).await {
                        self.send_message(&mut writer, &reply).await?;
                    }
                }
                Some(Err(e)) => {
                    error!("Error reading from client: {}", e);
                    break;
                }
            }
        }

        {
            let mut state = self.connection_state.write().await;
            *state = ConnectionState::Closed;
        }

        info!("MCP server stopped");
        Ok(())
    }

    /// Send a message to the client
    async fn send_message<W>(&self, writer: &mut W, message: &JsonRpcMessage) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let json = serde_json::to_string(message)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Get current connection state
    #[inline]
    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection_state.read().await
    }
}

impl MessageHandler {
    /// Create a new message handler
    #[inline]
    pub fn new(server: Arc<McpServer>) -> Self {
        Self { server }
    }

    /// Handle one raw line, returning the reply to send if any
    #[inline]
    pub async fn process_line(&self, line: &str) -> Option<JsonRpcMessage> {
        let raw_value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                let error = McpError::ParseError {
                    message: e.to_string(),
                };
                error.log();
                return Some(error.to_error_response(None));
            }
        };

        match serde_json::from_value::<JsonRpcMessage>(raw_value) {
            Ok(message) => self.process_message(message).await,
            Err(e) => {
                let error = McpError::InvalidRequest {
                    message: e.to_string(),
                };
                error.log();
                Some(error.to_error_response(None))
            }
        }
    }

    /// Process an incoming message
    #[inline]
    pub async fn process_message(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(request) => Some(self.handle_request(request).await),
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await;
                None
            }
            JsonRpcMessage::Response(_) | JsonRpcMessage::ErrorResponse(_) => {
                warn!("Received unexpected response message from client");
                None
            }
        }
    }

    /// Handle a JSON-RPC request
    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcMessage {
        if request.jsonrpc != JSONRPC_VERSION {
            let error = McpError::InvalidRequest {
                message: format!("unsupported jsonrpc version '{}'", request.jsonrpc),
            };
            error.log();
            return error.to_error_response(Some(request.id));
        }

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params).await,
            "tools/list" => self.handle_list_tools().await,
            "tools/call" => self.handle_call_tool(request.params).await,
            "ping" => Ok(serde_json::json!({})),
            method => Err(McpError::MethodNotFound {
                method: method.to_string(),
            }),
        };

        match response {
            Ok(result) => JsonRpcMessage::Response(JsonRpcResponse::new(result, request.id)),
            Err(e) => {
                e.log();
                e.to_error_response(Some(request.id))
            }
        }
    }

    /// Handle a JSON-RPC notification
    async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" | "initialized" => {
                let mut state = self.server.connection_state.write().await;
                *state = ConnectionState::Ready;
                info!("Server ready to handle requests");
            }
            "notifications/cancelled" => {
                debug!("Received cancellation notification");
            }
            _ => {
                warn!("Unknown notification method: {}", notification.method);
            }
        }
    }

    /// Handle initialize request
    #[inline]
    pub async fn handle_initialize(&self, params: Option<Value>) -> McpResult<Value> {
        let params: InitializeParams = match params {
            Some(p) => serde_json::from_value(p)?,
            None => {
                return Err(McpError::InvalidParameters {
                    message: "initialize request missing parameters".to_string(),
                });
            }
        };

        let protocol_version = negotiate_version(&params.protocol_version);
        if protocol_version != params.protocol_version {
            warn!(
                "Client requested protocol version {}, answering with {}",
                params.protocol_version, protocol_version
            );
        }

        {
            let mut state = self.server.connection_state.write().await;
            *state = ConnectionState::Initializing;
        }

        let result = InitializeResult {
            protocol_version: protocol_version.to_string(),
            capabilities: self.server.capabilities.clone(),
            server_info: self.server.server_info.clone(),
            instructions: self.server.instructions.clone(),
        };

        let client = params
            .client_info
            .as_ref()
            .map_or("unknown client", |info| info.name.as_str());
        info!("Client initialized: {}", client);
        to_result_value(&result)
    }

    /// Handle list tools request
    #[inline]
    pub async fn handle_list_tools(&self) -> McpResult<Value> {
        let tools = self.server.tools.read().await;
        let result = ListToolsResult {
            tools: tools.values().cloned().collect(),
        };
        to_result_value(&result)
    }

    /// Handle call tool request
    #[inline]
    pub async fn handle_call_tool(&self, params: Option<Value>) -> McpResult<Value> {
        let params: CallToolParams = match params {
            Some(p) => serde_json::from_value(p)?,
            None => {
                return Err(McpError::InvalidParameters {
                    message: "tool call request missing parameters".to_string(),
                });
            }
        };

        let handler = {
            let handlers = self.server.tool_handlers.read().await;
            handlers
                .get(&params.name)
                .cloned()
                .ok_or_else(|| McpError::ToolNotFound {
                    name: params.name.clone(),
                })?
        };

        debug!("Calling tool: {}", params.name);
        let result = handler.handle(params).await?;
        to_result_value(&result)
    }
}

fn to_result_value<T: serde::Serialize>(result: &T) -> McpResult<Value> {
    serde_json::to_value(result).map_err(|e| McpError::InternalError {
        message: e.to_string(),
    })
}
