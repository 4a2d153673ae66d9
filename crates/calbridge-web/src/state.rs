//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers. Everything stateful lives behind the broker's store, so the
//! state itself is read-only.

use std::sync::Arc;

use calbridge_broker::Broker;

use crate::WebConfig;
use crate::tools::ToolDispatcher;

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// The identity broker behind every OAuth endpoint and bearer check.
    pub broker: Broker,

    /// Executes `tools/call` on behalf of an authenticated subject.
    pub tools: Arc<dyn ToolDispatcher>,

    /// Web server configuration, including the public base URL.
    pub config: WebConfig,
}
