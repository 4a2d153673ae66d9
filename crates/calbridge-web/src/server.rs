//! Main web server setup and startup.
//!
//! [`WebServer`] composes the Axum router, registers all routes, and starts
//! the HTTP listener. It also spawns the background sweeper that garbage
//! collects expired sessions, login states and token pairs.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use calbridge_broker::Broker;

use crate::WebConfig;
use crate::discovery;
use crate::mcp;
use crate::oauth;
use crate::state::AppState;
use crate::tools::ToolDispatcher;

/// The calbridge HTTP server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    /// Create a new web server.
    ///
    /// # Arguments
    ///
    /// * `config` - Bind address, port and public base URL.
    /// * `broker` - The identity broker behind every endpoint.
    /// * `tools` - Executes MCP tool calls for authenticated subjects.
    pub fn new(config: WebConfig, broker: Broker, tools: Arc<dyn ToolDispatcher>) -> Self {
        let state = Arc::new(AppState {
            broker,
            tools,
            config: config.clone(),
        });
        Self { config, state }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Build the Axum router with all routes registered.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(HeaderValue::from_static("*"))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(tower_http::cors::Any)
            .expose_headers([axum::http::header::WWW_AUTHENTICATE]);

        Router::new()
            // Discovery.
            .route(
                "/.well-known/oauth-authorization-server",
                get(discovery::authorization_server_metadata),
            )
            .route(
                "/.well-known/oauth-protected-resource",
                get(discovery::protected_resource_metadata),
            )
            .route(
                "/.well-known/oauth-protected-resource/{*path}",
                get(discovery::protected_resource_metadata),
            )
            // Authorization server.
            .route("/oauth/register", post(oauth::register))
            .route("/oauth/authorize", get(oauth::authorize))
            .route("/oauth/token", post(oauth::token))
            // Upstream round trip and legacy login.
            .route("/auth/callback", get(oauth::callback))
            .route("/auth/login", get(oauth::login))
            // MCP (Model Context Protocol) endpoint.
            .route("/mcp", post(mcp::handle_mcp_request))
            .route("/health", get(discovery::health))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Start the server and block until ctrl-c.
    ///
    /// The sweeper runs for the lifetime of the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.addr();
        let router = self.router();

        let sweeper = spawn_sweeper(
            self.state.broker.clone(),
            self.state.broker.config().sweep_interval,
        );

        tracing::info!(addr = %addr, base_url = %self.config.base_url, "starting web server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
                tracing::info!("shutting down");
            })
            .await?;

        sweeper.abort();
        Ok(())
    }
}

/// Sweep expired broker state every `every` until the task is aborted.
///
/// A failed sweep is logged and retried on the next tick.
pub fn spawn_sweeper(broker: Broker, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match broker.sweep().await {
                Ok(report) if report.total() > 0 => tracing::info!(
                    sessions = report.sessions,
                    login_states = report.login_states,
                    token_pairs = report.token_pairs,
                    "swept expired state"
                ),
                Ok(_) => tracing::debug!("sweep found nothing to delete"),
                Err(e) => tracing::error!(error = %e, "sweep failed"),
            }
        }
    })
}
