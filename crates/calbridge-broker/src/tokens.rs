//! Token issuer: mints, validates and rotates broker bearer credentials and
//! garbage-collects expired broker state.

use calbridge_store::secret::{generate_token, hash_secret};
use calbridge_store::{
    AuthSessionStore, LoginStateStore, NewTokenPair, Replacement, Rotation, TokenStore,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::{BrokerConfig, secs};
use crate::error::{BrokerError, Result};

/// Bytes of entropy in access and refresh tokens.
const TOKEN_BYTES: usize = 32;

/// A freshly minted token pair, in token-endpoint response shape.
#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_token: String,
}

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub login_states: usize,
    pub token_pairs: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.sessions + self.login_states + self.token_pairs
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    tokens: TokenStore,
    sessions: AuthSessionStore,
    login_states: LoginStateStore,
    config: BrokerConfig,
}

impl TokenIssuer {
    pub fn new(
        tokens: TokenStore,
        sessions: AuthSessionStore,
        login_states: LoginStateStore,
        config: BrokerConfig,
    ) -> Self {
        Self {
            tokens,
            sessions,
            login_states,
            config,
        }
    }

    /// Mint an access/refresh pair for `subject` on behalf of `client_id`.
    #[instrument(skip(self))]
    pub async fn issue(&self, client_id: &str, subject: &str) -> Result<TokenGrant> {
        let (grant, access_hash, refresh_hash, expires_at) = self.mint()?;
        self.tokens
            .insert(NewTokenPair {
                client_id: client_id.to_string(),
                subject: subject.to_string(),
                access_hash,
                refresh_hash,
                expires_at,
            })
            .await?;
        debug!(expires_at, "token pair issued");
        Ok(grant)
    }

    /// Return the subject an access token was issued for.
    pub async fn validate(&self, access_token: &str) -> Result<String> {
        let pair = self
            .tokens
            .find_by_access(&hash_secret(access_token))
            .await?
            .ok_or(BrokerError::InvalidToken)?;
        if Utc::now().timestamp() > pair.expires_at {
            return Err(BrokerError::ExpiredToken);
        }
        Ok(pair.subject)
    }

    /// Exchange a refresh token for a new pair. The old pair stops working
    /// in the same transaction that stores the new one.
    #[instrument(skip(self, refresh_token))]
    pub async fn rotate(&self, refresh_token: &str, client_id: &str) -> Result<TokenGrant> {
        if refresh_token.is_empty() {
            return Err(BrokerError::MissingParameter("refresh_token"));
        }
        if client_id.is_empty() {
            return Err(BrokerError::MissingParameter("client_id"));
        }

        let (grant, access_hash, refresh_hash, expires_at) = self.mint()?;
        let not_before = Utc::now().timestamp() - secs(self.config.refresh_grace);
        let outcome = self
            .tokens
            .rotate(
                &hash_secret(refresh_token),
                client_id,
                not_before,
                Replacement {
                    access_hash,
                    refresh_hash,
                    expires_at,
                },
            )
            .await?;

        match outcome {
            Rotation::Rotated { .. } => {
                debug!(expires_at, "token pair rotated");
                Ok(grant)
            }
            Rotation::Unknown => Err(BrokerError::InvalidToken),
            Rotation::ClientMismatch => Err(BrokerError::ClientMismatch),
        }
    }

    /// Delete expired sessions and login states, and token pairs whose
    /// refresh grace has run out.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now().timestamp();
        let report = SweepReport {
            sessions: self.sessions.delete_expired(now).await?,
            login_states: self.login_states.delete_expired(now).await?,
            token_pairs: self
                .tokens
                .delete_stale(now - secs(self.config.refresh_grace))
                .await?,
        };
        if report.total() > 0 {
            info!(
                sessions = report.sessions,
                login_states = report.login_states,
                token_pairs = report.token_pairs,
                "swept expired broker state"
            );
        }
        Ok(report)
    }

    fn mint(&self) -> Result<(TokenGrant, String, String, i64)> {
        let access_token = generate_token(TOKEN_BYTES)?;
        let refresh_token = generate_token(TOKEN_BYTES)?;
        let ttl = secs(self.config.access_token_ttl);
        let access_hash = hash_secret(&access_token);
        let refresh_hash = hash_secret(&refresh_token);
        Ok((
            TokenGrant {
                access_token,
                token_type: "Bearer",
                expires_in: ttl,
                refresh_token,
            },
            access_hash,
            refresh_hash,
            Utc::now().timestamp() + ttl,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calbridge_store::Database;

    async fn setup() -> (Database, TokenIssuer) {
        let db = Database::in_memory().await.unwrap();
        let issuer = TokenIssuer::new(
            TokenStore::new(db.clone()),
            AuthSessionStore::new(db.clone()),
            LoginStateStore::new(db.clone()),
            BrokerConfig::default(),
        );
        (db, issuer)
    }

    async fn set_expiry(db: &Database, expires_at: i64) {
        db.execute(move |conn| {
            conn.execute("UPDATE token_pairs SET expires_at = ?1", [expires_at])?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn issue_then_validate() {
        let (_db, issuer) = setup().await;
        let grant = issuer.issue("c1", "a@example.com").await.unwrap();
        assert_eq!(grant.token_type, "Bearer");
        assert_eq!(grant.expires_in, 3600);
        assert_ne!(grant.access_token, grant.refresh_token);
        assert_eq!(
            issuer.validate(&grant.access_token).await.unwrap(),
            "a@example.com"
        );
    }

    #[tokio::test]
    async fn validate_rejects_unknown_and_expired() {
        let (db, issuer) = setup().await;
        assert!(matches!(
            issuer.validate("nope").await,
            Err(BrokerError::InvalidToken)
        ));

        let grant = issuer.issue("c1", "a@example.com").await.unwrap();
        // The refresh token is not an access token.
        assert!(matches!(
            issuer.validate(&grant.refresh_token).await,
            Err(BrokerError::InvalidToken)
        ));

        set_expiry(&db, Utc::now().timestamp() - 1).await;
        assert!(matches!(
            issuer.validate(&grant.access_token).await,
            Err(BrokerError::ExpiredToken)
        ));
    }

    #[tokio::test]
    async fn rotation_chain() {
        let (_db, issuer) = setup().await;
        let first = issuer.issue("c1", "a@example.com").await.unwrap();
        let second = issuer.rotate(&first.refresh_token, "c1").await.unwrap();

        assert!(matches!(
            issuer.rotate(&first.refresh_token, "c1").await,
            Err(BrokerError::InvalidToken)
        ));
        assert!(matches!(
            issuer.validate(&first.access_token).await,
            Err(BrokerError::InvalidToken)
        ));
        assert_eq!(
            issuer.validate(&second.access_token).await.unwrap(),
            "a@example.com"
        );

        let third = issuer.rotate(&second.refresh_token, "c1").await.unwrap();
        assert_eq!(
            issuer.validate(&third.access_token).await.unwrap(),
            "a@example.com"
        );
    }

    #[tokio::test]
    async fn rotate_checks_client() {
        let (_db, issuer) = setup().await;
        let grant = issuer.issue("c1", "a@example.com").await.unwrap();
        assert!(matches!(
            issuer.rotate(&grant.refresh_token, "c2").await,
            Err(BrokerError::ClientMismatch)
        ));
        // The legitimate owner can still rotate.
        issuer.rotate(&grant.refresh_token, "c1").await.unwrap();
    }

    #[tokio::test]
    async fn refresh_survives_access_expiry_within_grace() {
        let (db, issuer) = setup().await;
        let grant = issuer.issue("c1", "a@example.com").await.unwrap();

        set_expiry(&db, Utc::now().timestamp() - 24 * 3600).await;
        issuer.rotate(&grant.refresh_token, "c1").await.unwrap();
    }

    #[tokio::test]
    async fn refresh_fails_past_grace() {
        let (db, issuer) = setup().await;
        let grant = issuer.issue("c1", "a@example.com").await.unwrap();

        set_expiry(&db, Utc::now().timestamp() - 8 * 24 * 3600).await;
        assert!(matches!(
            issuer.rotate(&grant.refresh_token, "c1").await,
            Err(BrokerError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn sweep_keeps_pairs_within_grace() {
        let (db, issuer) = setup().await;
        issuer.issue("c1", "a@example.com").await.unwrap();
        set_expiry(&db, Utc::now().timestamp() - 3600).await;

        let report = issuer.sweep().await.unwrap();
        assert_eq!(report.token_pairs, 0);

        set_expiry(&db, Utc::now().timestamp() - 8 * 24 * 3600).await;
        let report = issuer.sweep().await.unwrap();
        assert_eq!(report.token_pairs, 1);
        assert_eq!(report.total(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_expired_login_states() {
        let (db, issuer) = setup().await;
        let states = LoginStateStore::new(db);
        states.insert("ls.old", 1).await.unwrap();
        states.insert("ls.new", i64::MAX).await.unwrap();

        let report = issuer.sweep().await.unwrap();
        assert_eq!(report.login_states, 1);
        assert!(states.consume("ls.new", Utc::now().timestamp()).await.unwrap());
    }
}
