//! The bearer-protected MCP (Model Context Protocol) endpoint.
//!
//! Speaks JSON-RPC 2.0 over HTTP for one authenticated
//! subject per request. Supports `initialize`, `ping`, `tools/list`,
//! `tools/call` and `resources/list`; requests without an `id` are
//! notifications and get no response body.
//!
//! Every request must carry a bearer credential the broker resolves to a
//! subject; otherwise the endpoint answers `401` with a `WWW-Authenticate`
//! challenge pointing at the protected-resource metadata.
//! Protocol revision `2024-11-05`.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use calbridge_broker::{Broker, ErrorKind, ResolvedBearer};

use crate::state::AppState;
use crate::tools::{ToolCall, ToolDispatcher};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "calbridge";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One JSON-RPC message from the client. `id` is absent or null for
/// notifications; `params` defaults to null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }
}

/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn reply(id: Option<Value>, outcome: Result<Value, JsonRpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            jsonrpc: "2.0".into(),
            id,
            result,
            error,
        }
    }

    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self::reply(id, Ok(result))
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self::reply(
            id,
            Err(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        )
    }

    pub fn error_with_data(
        id: Option<Value>,
        code: i32,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self::reply(
            id,
            Err(JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            }),
        )
    }
}

/// Entry of a `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result of `tools/call`. Tool failures are results with `isError` set,
/// not JSON-RPC errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl McpToolResult {
    fn text(text: String, is_error: Option<bool>) -> Self {
        Self {
            content: vec![McpContent {
                content_type: "text".into(),
                text,
            }],
            is_error,
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::text(text.into(), None)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::text(text.into(), Some(true))
    }
}

// ---------------------------------------------------------------------------
// McpServer
// ---------------------------------------------------------------------------

/// MCP protocol server bound to one authenticated caller.
pub struct McpServer {
    broker: Broker,
    tools: Arc<dyn ToolDispatcher>,
    caller: ResolvedBearer,
}

impl McpServer {
    pub fn new(broker: Broker, tools: Arc<dyn ToolDispatcher>, caller: ResolvedBearer) -> Self {
        Self {
            broker,
            tools,
            caller,
        }
    }

    /// Handle one JSON-RPC message. Notifications yield `None`.
    pub async fn handle_message(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            tracing::debug!(method = %request.method, "MCP notification received");
            return None;
        }
        Some(self.handle_request(request).await)
    }

    /// Handle a single JSON-RPC request and return a response.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        tracing::debug!(method = %request.method, subject = %self.caller.subject, "MCP request received");

        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::error(request.id, INVALID_REQUEST, "jsonrpc must be 2.0");
        }

        match request.method.as_str() {
            "initialize" => self.handle_initialize(request.id),
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            "tools/list" => self.handle_tools_list(request.id),
            "tools/call" => self.handle_tools_call(request.id, request.params).await,
            "resources/list" => JsonRpcResponse::success(request.id, json!({ "resources": [] })),
            other => {
                tracing::warn!(method = %other, "unknown MCP method");
                JsonRpcResponse::error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("method not found: {other}"),
                )
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION
                }
            }),
        )
    }

    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        let tools: Vec<McpToolDefinition> = self
            .tools
            .tools()
            .into_iter()
            .map(|t| McpToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: t.parameters,
            })
            .collect();
        match serde_json::to_value(&tools) {
            Ok(tools_value) => JsonRpcResponse::success(id, json!({ "tools": tools_value })),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize tool list");
                JsonRpcResponse::error(id, INTERNAL_ERROR, "failed to serialize tool list")
            }
        }
    }

    /// Resolve a live upstream token for the caller, then dispatch.
    async fn handle_tools_call(&self, id: Option<Value>, params: Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                "missing required field `name` in params",
            );
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let upstream_access_token = match self
            .broker
            .upstream_access_token(&self.caller.subject)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, subject = %self.caller.subject, "no usable upstream token");
                return JsonRpcResponse::error_with_data(
                    id,
                    INTERNAL_ERROR,
                    "upstream authorization unavailable",
                    json!({ "hint": "sign in again" }),
                );
            }
        };

        let result = match self
            .tools
            .call(ToolCall {
                subject: &self.caller.subject,
                upstream_access_token: &upstream_access_token,
                name,
                arguments: &arguments,
            })
            .await
        {
            Ok(Value::String(text)) => McpToolResult::success(text),
            Ok(other) => McpToolResult::success(
                serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
            ),
            Err(e) => McpToolResult::error(e.to_string()),
        };

        match serde_json::to_value(&result) {
            Ok(v) => JsonRpcResponse::success(id, v),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize tool result");
                JsonRpcResponse::error(id, INTERNAL_ERROR, "failed to serialize tool result")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The credential from an `Authorization: Bearer …` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn unauthorized(base_url: &str, message: &str) -> Response {
    let challenge = format!(
        r#"Bearer resource_metadata="{base_url}/.well-known/oauth-protected-resource""#
    );
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(json!({ "error": message })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `POST /mcp`
///
/// Accepts either a single JSON-RPC message or a batch array. A body made
/// only of notifications is acknowledged with `202 Accepted`.
pub async fn handle_mcp_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(bearer) = bearer_token(&headers) else {
        return unauthorized(&state.config.base_url, "missing Authorization header");
    };
    let caller = match state.broker.resolve_bearer(bearer).await {
        Ok(caller) => caller,
        Err(e) if e.kind() == ErrorKind::Unauthenticated => {
            return unauthorized(&state.config.base_url, "invalid credentials");
        }
        Err(e) => {
            tracing::error!(error = %e, "bearer resolution failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal server error" })),
            )
                .into_response();
        }
    };

    let mcp = McpServer::new(state.broker.clone(), Arc::clone(&state.tools), caller);

    // Try to parse as an array first (batch request), then as a single request.
    if let Ok(batch) = serde_json::from_str::<Vec<JsonRpcRequest>>(&body) {
        if batch.is_empty() {
            return Json(json!(JsonRpcResponse::error(
                None,
                INVALID_REQUEST,
                "empty batch request",
            )))
            .into_response();
        }
        let mut responses = Vec::with_capacity(batch.len());
        for req in batch {
            if let Some(response) = mcp.handle_message(req).await {
                responses.push(response);
            }
        }
        if responses.is_empty() {
            return StatusCode::ACCEPTED.into_response();
        }
        return Json(json!(responses)).into_response();
    }

    match serde_json::from_str::<JsonRpcRequest>(&body) {
        Ok(request) => match mcp.handle_message(request).await {
            Some(response) => Json(json!(response)).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
        Err(e) => Json(json!(JsonRpcResponse::error(
            None,
            PARSE_ERROR,
            format!("failed to parse JSON-RPC request: {e}"),
        )))
        .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
