//! HTTP surface for calbridge.
//!
//! This crate puts the [`calbridge_broker::Broker`] on the wire:
//!
//! - OAuth 2.0 endpoints: dynamic registration, authorization, the upstream
//!   callback and the token endpoint.
//! - Discovery metadata (RFC 8414 and RFC 9728) so MCP clients can find them.
//! - The legacy API-key login page.
//! - A bearer-protected MCP (Model Context Protocol) endpoint whose tool
//!   calls are delegated to a [`ToolDispatcher`].

pub mod discovery;
pub mod html;
pub mod mcp;
pub mod oauth;
pub mod server;
pub mod state;
pub mod tools;

pub use mcp::McpServer;
pub use server::WebServer;
pub use state::AppState;
pub use tools::{ToolCall, ToolDefinition, ToolDispatcher, ToolError, Whoami};

/// Web server configuration.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
    /// Public base URL (scheme, host and optional port, no trailing slash).
    /// Every endpoint URL advertised to clients is derived from it.
    pub base_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8080,
            base_url: "http://localhost:8080".into(),
        }
    }
}

impl WebConfig {
    /// `{base_url}{path}` for an absolute endpoint URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}
