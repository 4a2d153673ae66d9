//! OAuth discovery documents and the health probe.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// `GET /.well-known/oauth-authorization-server` (RFC 8414).
pub async fn authorization_server_metadata(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "issuer": config.base_url,
        "authorization_endpoint": config.endpoint("/oauth/authorize"),
        "token_endpoint": config.endpoint("/oauth/token"),
        "registration_endpoint": config.endpoint("/oauth/register"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "token_endpoint_auth_methods_supported": ["none"],
        "code_challenge_methods_supported": ["S256"],
    }))
}

/// `GET /.well-known/oauth-protected-resource[/{path}]` (RFC 9728).
pub async fn protected_resource_metadata(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "resource": state.config.endpoint("/mcp"),
        "authorization_servers": [state.config.base_url],
    }))
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
