//! OAuth 2.0 endpoints: registration, authorization, the upstream callback,
//! the legacy login start and the token endpoint.
//!
//! Handlers stay thin; every decision is made by the broker and every
//! failure is rendered by [`OAuthError`].

use std::sync::Arc;

use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::json;

use calbridge_broker::{
    AuthorizeParams, BrokerError, CallbackOutcome, CallbackParams, ErrorKind, TokenParams,
};

use crate::html;
use crate::state::AppState;

/// RFC 6749 error body rendered from a [`BrokerError`].
///
/// Client mistakes are 400 with the broker's message; internal failures are
/// logged and surface as a generic 500 `server_error`.
#[derive(Debug)]
pub struct OAuthError(pub BrokerError);

impl From<BrokerError> for OAuthError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match err.kind() {
            ErrorKind::Upstream | ErrorKind::Storage => {
                tracing::error!(error = %err, "oauth request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Validation | ErrorKind::UnknownEntity | ErrorKind::Grant => {
                tracing::debug!(error = %err, "oauth request rejected");
                StatusCode::BAD_REQUEST
            }
        };
        oauth_error_body(status, err.oauth_error_code(), &err.public_description())
    }
}

fn oauth_error_body(status: StatusCode, code: &str, description: &str) -> Response {
    (
        status,
        [(header::CACHE_CONTROL, "no-store")],
        Json(json!({
            "error": code,
            "error_description": description,
        })),
    )
        .into_response()
}

/// `302 Found` to `location`.
fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

// ---------------------------------------------------------------------------
// Dynamic client registration
// ---------------------------------------------------------------------------

/// Body of `POST /oauth/register` (RFC 7591).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// `POST /oauth/register`
pub async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, OAuthError> {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "registration body rejected");
            return Ok(oauth_error_body(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "invalid JSON body",
            ));
        }
    };

    let client = state
        .broker
        .register(&request.client_name, request.redirect_uris)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "client_id": client.client_id,
            "client_name": client.client_name,
            "redirect_uris": client.redirect_uris,
            "token_endpoint_auth_method": "none",
        })),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// `GET /oauth/authorize`
///
/// Invalid requests get a JSON error and are never redirected, so an
/// unregistered `redirect_uri` cannot be turned into an open redirect.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response, OAuthError> {
    let upstream_url = state.broker.authorize(&params).await?;
    Ok(found(upstream_url))
}

/// `GET /auth/callback`, where the upstream provider sends the user agent
/// back for both the authorization and the login flow.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match state.broker.complete_callback(&params).await {
        Ok(CallbackOutcome::Redirect(location)) => found(location),
        Ok(CallbackOutcome::LoginCompleted { subject, api_key }) => {
            tracing::info!(%subject, "login completed, API key issued");
            (
                [(header::CACHE_CONTROL, "no-store")],
                Html(html::login_success(&subject, &api_key)),
            )
                .into_response()
        }
        Ok(CallbackOutcome::LoginDenied { reason }) => {
            tracing::warn!(%reason, "login denied upstream");
            Html(html::login_failed(&reason)).into_response()
        }
        Err(BrokerError::UnknownSession) => {
            (StatusCode::BAD_REQUEST, "invalid state parameter").into_response()
        }
        Err(err) if err.is_internal() => {
            tracing::error!(error = %err, "login callback failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "authentication failed").into_response()
        }
        Err(err) => (StatusCode::BAD_REQUEST, err.public_description()).into_response(),
    }
}

/// `GET /auth/login`: start the legacy API-key login flow.
pub async fn login(State(state): State<Arc<AppState>>) -> Response {
    match state.broker.begin_login().await {
        Ok(upstream_url) => found(upstream_url),
        Err(err) => {
            tracing::error!(error = %err, "failed to start login");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

/// `POST /oauth/token` (form encoded).
pub async fn token(
    State(state): State<Arc<AppState>>,
    form: Result<Form<TokenParams>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(params) = match form {
        Ok(form) => form,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "token request body rejected");
            return Ok(oauth_error_body(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "expected an application/x-www-form-urlencoded body",
            ));
        }
    };

    let grant = state.broker.exchange_token(&params).await?;
    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(grant),
    )
        .into_response())
}
