//! The [`Broker`] facade: one value wiring the registry, session manager,
//! token issuer and bearer resolver to a store and an upstream provider.
//!
//! Request parameter structs here are deserializable straight from query
//! strings and form bodies; absent fields become empty strings so the
//! component that owns a check reports it.

use std::sync::Arc;

use calbridge_store::{
    AuthSession, AuthSessionStore, Client, ClientStore, Database, LoginStateStore, SubjectStore,
    SubjectUpdate, TokenStore,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::bearer::{BearerResolver, ResolvedBearer};
use crate::callback_state::CallbackFlow;
use crate::config::{BrokerConfig, secs};
use crate::error::{BrokerError, Result};
use crate::registry::ClientRegistry;
use crate::session::{BeginAuthorization, RedeemCode, SessionManager};
use crate::tokens::{SweepReport, TokenGrant, TokenIssuer};
use crate::upstream::UpstreamProvider;

/// Query parameters of the authorization endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeParams {
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub code_challenge: String,
    #[serde(default)]
    pub code_challenge_method: String,
    #[serde(default)]
    pub state: String,
}

/// Form fields of the token endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenParams {
    #[serde(default)]
    pub grant_type: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub code_verifier: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub refresh_token: String,
}

/// Query parameters the upstream provider sends to the callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub error: String,
}

/// What the callback endpoint should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Send the user agent back to the OAuth client.
    Redirect(String),
    /// The login flow finished; the API key is shown exactly once.
    LoginCompleted { subject: String, api_key: String },
    /// The user did not grant access during the login flow.
    LoginDenied { reason: String },
}

#[derive(Clone)]
pub struct Broker {
    config: BrokerConfig,
    registry: ClientRegistry,
    sessions: SessionManager,
    tokens: TokenIssuer,
    bearer: BearerResolver,
    subjects: SubjectStore,
    login_states: LoginStateStore,
    upstream: Arc<dyn UpstreamProvider>,
}

impl Broker {
    pub fn new(db: Database, upstream: Arc<dyn UpstreamProvider>, config: BrokerConfig) -> Self {
        let registry = ClientRegistry::new(ClientStore::new(db.clone()));
        let auth_sessions = AuthSessionStore::new(db.clone());
        let login_states = LoginStateStore::new(db.clone());
        let subjects = SubjectStore::new(db.clone());
        let tokens = TokenIssuer::new(
            TokenStore::new(db),
            auth_sessions.clone(),
            login_states.clone(),
            config.clone(),
        );
        Self {
            sessions: SessionManager::new(registry.clone(), auth_sessions, config.clone()),
            bearer: BearerResolver::new(tokens.clone(), subjects.clone()),
            registry,
            tokens,
            subjects,
            login_states,
            upstream,
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn bearer(&self) -> &BearerResolver {
        &self.bearer
    }

    // -- authorization server ---------------------------------------------

    pub async fn register(&self, client_name: &str, redirect_uris: Vec<String>) -> Result<Client> {
        self.registry.register(client_name, redirect_uris).await
    }

    /// Validate an authorization request, open a session and return the
    /// upstream URL to redirect the user agent to.
    #[instrument(skip(self, params), fields(client_id = %params.client_id))]
    pub async fn authorize(&self, params: &AuthorizeParams) -> Result<String> {
        if params.response_type != "code" {
            return Err(BrokerError::UnsupportedResponseType(
                params.response_type.clone(),
            ));
        }
        let state = self
            .sessions
            .begin(BeginAuthorization {
                client_id: &params.client_id,
                redirect_uri: &params.redirect_uri,
                code_challenge: &params.code_challenge,
                code_challenge_method: &params.code_challenge_method,
                caller_state: &params.state,
            })
            .await?;
        self.upstream.authorization_url(&state)
    }

    /// Token endpoint: dispatch on `grant_type`.
    #[instrument(skip(self, params), fields(grant_type = %params.grant_type, client_id = %params.client_id))]
    pub async fn exchange_token(&self, params: &TokenParams) -> Result<TokenGrant> {
        match params.grant_type.as_str() {
            "authorization_code" => {
                let subject = self
                    .sessions
                    .redeem(RedeemCode {
                        code: &params.code,
                        client_id: &params.client_id,
                        redirect_uri: &params.redirect_uri,
                        code_verifier: &params.code_verifier,
                    })
                    .await?;
                let grant = self.tokens.issue(&params.client_id, &subject).await?;
                info!(%subject, "authorization code exchanged");
                Ok(grant)
            }
            "refresh_token" => {
                self.tokens
                    .rotate(&params.refresh_token, &params.client_id)
                    .await
            }
            other => Err(BrokerError::UnsupportedGrantType(other.to_string())),
        }
    }

    pub async fn resolve_bearer(&self, bearer: &str) -> Result<ResolvedBearer> {
        self.bearer.resolve(bearer).await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.tokens.sweep().await
    }

    // -- API-key login flow -------------------------------------------------

    /// Start the login flow: store a login state and return the upstream URL.
    #[instrument(skip(self))]
    pub async fn begin_login(&self) -> Result<String> {
        let state = CallbackFlow::Login.new_state()?;
        let expires_at = Utc::now().timestamp() + secs(self.config.session_ttl);
        self.login_states.insert(&state, expires_at).await?;
        self.upstream.authorization_url(&state)
    }

    // -- upstream callback ----------------------------------------------------

    /// Handle the upstream provider's redirect back to the broker.
    ///
    /// `Err` means the state belongs to no pending flow (or, for the login
    /// flow, that the upstream hop failed). Authorization-flow failures after
    /// the session is found are reported to the client by redirect instead.
    #[instrument(skip(self, params), fields(has_error = !params.error.is_empty()))]
    pub async fn complete_callback(&self, params: &CallbackParams) -> Result<CallbackOutcome> {
        match CallbackFlow::of(&params.state) {
            Some(CallbackFlow::Authorization) => {
                let session = self.sessions.lookup(&params.state).await?;
                self.complete_authorization(&session, params).await
            }
            Some(CallbackFlow::Login) => self.complete_login(params).await,
            None => Err(BrokerError::UnknownSession),
        }
    }

    async fn complete_authorization(
        &self,
        session: &AuthSession,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome> {
        let caller_state = session.caller_state.as_deref();
        if !params.error.is_empty() {
            warn!(upstream_error = %params.error, "upstream denied authorization");
            return redirect_with_error(
                &session.redirect_uri,
                "access_denied",
                &params.error,
                caller_state,
            );
        }
        if params.code.is_empty() {
            return redirect_with_error(
                &session.redirect_uri,
                "server_error",
                "no authorization code from upstream",
                caller_state,
            );
        }

        let code = match self.sign_in_upstream(&params.code).await {
            Ok((subject, _api_key)) => self.sessions.resolve(&session.state, &subject).await,
            Err(e) => Err(e),
        };
        match code {
            Ok(code) => {
                let mut url = Url::parse(&session.redirect_uri)?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("code", &code);
                    if let Some(state) = caller_state {
                        query.append_pair("state", state);
                    }
                }
                Ok(CallbackOutcome::Redirect(url.to_string()))
            }
            Err(e) => {
                error!(error = %e, "authorization callback failed");
                redirect_with_error(
                    &session.redirect_uri,
                    "server_error",
                    "authorization with the upstream provider failed",
                    caller_state,
                )
            }
        }
    }

    async fn complete_login(&self, params: &CallbackParams) -> Result<CallbackOutcome> {
        if !self
            .login_states
            .consume(&params.state, Utc::now().timestamp())
            .await?
        {
            return Err(BrokerError::UnknownSession);
        }
        if !params.error.is_empty() {
            return Ok(CallbackOutcome::LoginDenied {
                reason: params.error.clone(),
            });
        }
        if params.code.is_empty() {
            return Err(BrokerError::MissingParameter("code"));
        }

        let (subject, api_key) = self.sign_in_upstream(&params.code).await?;
        Ok(CallbackOutcome::LoginCompleted { subject, api_key })
    }

    /// Exchange an upstream code, identify the subject and store its token.
    /// Returns the subject and its freshly rotated API key.
    async fn sign_in_upstream(&self, code: &str) -> Result<(String, String)> {
        let token = self.upstream.exchange_code(code).await?;
        let subject = self.upstream.fetch_subject(&token).await?;
        let api_key = self
            .subjects
            .upsert(SubjectUpdate {
                subject: subject.clone(),
                upstream_token: token,
            })
            .await?;
        info!(%subject, "subject authenticated upstream");
        Ok((subject, api_key))
    }

    // -- upstream token access -----------------------------------------------

    /// A usable upstream access token for `subject`, refreshed and persisted
    /// first if it is expired or about to be.
    #[instrument(skip(self))]
    pub async fn upstream_access_token(&self, subject: &str) -> Result<String> {
        let record = self
            .subjects
            .get(subject)
            .await?
            .ok_or_else(|| BrokerError::UnknownSubject(subject.to_string()))?;
        let current = record.upstream_token;

        let margin = secs(self.config.upstream_refresh_margin);
        if !current.needs_refresh(Utc::now().timestamp(), margin) {
            return Ok(current.access_token);
        }

        let refresh_token =
            current
                .refresh_token
                .as_deref()
                .ok_or_else(|| BrokerError::Upstream {
                    reason: format!("upstream token for {subject} expired and has no refresh token"),
                })?;
        let refreshed = self
            .upstream
            .refresh(refresh_token)
            .await?
            .inherit_refresh_token(&current);
        self.subjects
            .update_upstream_token(subject, &refreshed)
            .await?;
        info!("upstream access token refreshed");
        Ok(refreshed.access_token)
    }
}

fn redirect_with_error(
    redirect_uri: &str,
    error_code: &str,
    description: &str,
    caller_state: Option<&str>,
) -> Result<CallbackOutcome> {
    let mut url = Url::parse(redirect_uri)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("error", error_code);
        query.append_pair("error_description", description);
        if let Some(state) = caller_state {
            query.append_pair("state", state);
        }
    }
    Ok(CallbackOutcome::Redirect(url.to_string()))
}
