//! The seam between the MCP endpoint and whatever executes tools.
//!
//! The MCP layer authenticates the caller and obtains a live upstream
//! access token; a [`ToolDispatcher`] does the actual work with it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A tool advertised through `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Machine-readable tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's input.
    pub parameters: Value,
}

/// One authenticated `tools/call` invocation.
#[derive(Debug, Clone, Copy)]
pub struct ToolCall<'a> {
    /// The subject the bearer credential resolved to.
    pub subject: &'a str,
    /// A currently valid upstream access token for that subject.
    pub upstream_access_token: &'a str,
    pub name: &'a str,
    pub arguments: &'a Value,
}

/// Errors a dispatcher reports back as an MCP error result.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool execution failed: {0}")]
    Failed(String),
}

/// Executes MCP tools for an authenticated subject.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Return the tools this dispatcher exposes.
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Execute a named tool. The returned value becomes the text content of
    /// the MCP result.
    async fn call(&self, call: ToolCall<'_>) -> Result<Value, ToolError>;
}

/// Minimal dispatcher exposing a single `whoami` tool that reports the
/// authenticated subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct Whoami;

#[async_trait]
impl ToolDispatcher for Whoami {
    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "whoami".into(),
            description: "Return the account this connection is authorized for".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }]
    }

    async fn call(&self, call: ToolCall<'_>) -> Result<Value, ToolError> {
        match call.name {
            "whoami" => Ok(json!({ "subject": call.subject })),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}
