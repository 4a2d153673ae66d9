//! Authorization session manager.
//!
//! Tracks each in-flight authorization from `begin` (the client hits the
//! authorize endpoint) through `resolve` (the upstream callback names the
//! subject) to `redeem` (the client exchanges its one-time code).

use calbridge_store::secret::{generate_token, hash_secret};
use calbridge_store::{AuthSession, AuthSessionStore, NewAuthSession, Redemption};
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::callback_state::CallbackFlow;
use crate::config::{BrokerConfig, secs};
use crate::error::{BrokerError, Result};
use crate::pkce;
use crate::registry::ClientRegistry;

/// Bytes of entropy in a one-time authorization code.
const CODE_BYTES: usize = 32;

/// Parameters of a validated authorization request.
#[derive(Debug, Clone)]
pub struct BeginAuthorization<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub code_challenge: &'a str,
    pub code_challenge_method: &'a str,
    /// The client's own `state`, echoed back on redirect. Empty means none.
    pub caller_state: &'a str,
}

/// Parameters of a code exchange.
#[derive(Debug, Clone)]
pub struct RedeemCode<'a> {
    pub code: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub code_verifier: &'a str,
}

#[derive(Clone)]
pub struct SessionManager {
    registry: ClientRegistry,
    sessions: AuthSessionStore,
    config: BrokerConfig,
}

impl SessionManager {
    pub fn new(registry: ClientRegistry, sessions: AuthSessionStore, config: BrokerConfig) -> Self {
        Self {
            registry,
            sessions,
            config,
        }
    }

    /// Open a session and return the broker state to send upstream.
    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn begin(&self, request: BeginAuthorization<'_>) -> Result<String> {
        if request.client_id.is_empty() {
            return Err(BrokerError::MissingParameter("client_id"));
        }
        let client = self.registry.get(request.client_id).await?;
        if !client.allows_redirect(request.redirect_uri) {
            return Err(BrokerError::RedirectUriMismatch);
        }
        if request.code_challenge.is_empty() {
            return Err(BrokerError::MissingParameter("code_challenge"));
        }
        if request.code_challenge_method != pkce::METHOD_S256 {
            return Err(BrokerError::UnsupportedChallengeMethod(
                request.code_challenge_method.to_string(),
            ));
        }

        let state = CallbackFlow::Authorization.new_state()?;
        let expires_at = Utc::now().timestamp() + secs(self.config.session_ttl);
        self.sessions
            .create(NewAuthSession {
                state: state.clone(),
                client_id: client.client_id,
                redirect_uri: request.redirect_uri.to_string(),
                code_challenge: request.code_challenge.to_string(),
                code_challenge_method: pkce::METHOD_S256.to_string(),
                caller_state: (!request.caller_state.is_empty())
                    .then(|| request.caller_state.to_string()),
                expires_at,
            })
            .await?;

        debug!(expires_at, "authorization session opened");
        Ok(state)
    }

    /// The pending, unexpired session for `state`.
    pub async fn lookup(&self, state: &str) -> Result<AuthSession> {
        if CallbackFlow::of(state) != Some(CallbackFlow::Authorization) {
            return Err(BrokerError::UnknownSession);
        }
        self.sessions
            .find_pending(state, Utc::now().timestamp())
            .await?
            .ok_or(BrokerError::UnknownSession)
    }

    /// Bind `subject` to the pending session and mint its one-time code.
    /// Only the code's hash is stored; the raw code is returned once.
    #[instrument(skip(self, state))]
    pub async fn resolve(&self, state: &str, subject: &str) -> Result<String> {
        let code = generate_token(CODE_BYTES)?;
        let attached = self
            .sessions
            .attach_code(state, &hash_secret(&code), subject, Utc::now().timestamp())
            .await?;
        if !attached {
            return Err(BrokerError::UnknownSession);
        }
        debug!("authorization session resolved");
        Ok(code)
    }

    /// Consume a one-time code and return the subject it was issued for.
    ///
    /// The code is burned before the client, redirect URI and PKCE proof
    /// are checked, so a failed attempt still invalidates it.
    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn redeem(&self, request: RedeemCode<'_>) -> Result<String> {
        if request.code.is_empty() {
            return Err(BrokerError::MissingParameter("code"));
        }
        if request.code_verifier.is_empty() {
            return Err(BrokerError::MissingParameter("code_verifier"));
        }
        if request.client_id.is_empty() {
            return Err(BrokerError::MissingParameter("client_id"));
        }

        let session = match self
            .sessions
            .consume_code(&hash_secret(request.code), Utc::now().timestamp())
            .await?
        {
            Redemption::Consumed(session) => session,
            Redemption::Invalid => return Err(BrokerError::InvalidCode),
            Redemption::AlreadyUsed => {
                warn!("replayed authorization code");
                return Err(BrokerError::CodeAlreadyUsed);
            }
            Redemption::Expired => return Err(BrokerError::CodeExpired),
        };

        if session.client_id != request.client_id {
            return Err(BrokerError::InvalidGrant("client_id mismatch"));
        }
        if session.redirect_uri != request.redirect_uri {
            return Err(BrokerError::InvalidGrant("redirect_uri mismatch"));
        }
        if !pkce::verify(request.code_verifier, &session.code_challenge) {
            return Err(BrokerError::InvalidGrant("PKCE verification failed"));
        }

        session.subject.ok_or(BrokerError::InvalidCode)
    }
}
