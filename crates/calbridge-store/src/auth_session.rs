//! Authorization sessions: in-flight authorization attempts of registered
//! clients.
//!
//! A session moves through `Created → Resolved → Redeemed`. Each transition
//! is a single conditional `UPDATE` that re-checks the expected phase and the
//! expiry in the same statement, so two racing callers can never both win.
//! Expired rows are removed by [`AuthSessionStore::delete_expired`]; until
//! then, every read and transition treats them as absent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

const SESSION_COLUMNS: &str = "state, client_id, redirect_uri, code_challenge, \
     code_challenge_method, caller_state, code_hash, subject, expires_at, used, created_at";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Waiting for the upstream callback.
    Created,
    /// Upstream identity known, one-time code issued.
    Resolved,
    /// Code exchanged. Terminal.
    Redeemed,
}

/// A persisted authorization session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// Broker-generated correlation state sent to the upstream provider.
    pub state: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    /// Opaque state supplied by the client, echoed back on redirect.
    pub caller_state: Option<String>,
    /// Hash of the one-time code, set once the session is resolved.
    pub code_hash: Option<String>,
    /// Upstream subject, set once the session is resolved.
    pub subject: Option<String>,
    pub expires_at: i64,
    pub used: bool,
    pub created_at: i64,
}

impl AuthSession {
    pub fn phase(&self) -> SessionPhase {
        if self.used {
            SessionPhase::Redeemed
        } else if self.code_hash.is_some() {
            SessionPhase::Resolved
        } else {
            SessionPhase::Created
        }
    }

    /// Whether the session is past its expiry at unix time `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            state: row.get(0)?,
            client_id: row.get(1)?,
            redirect_uri: row.get(2)?,
            code_challenge: row.get(3)?,
            code_challenge_method: row.get(4)?,
            caller_state: row.get(5)?,
            code_hash: row.get(6)?,
            subject: row.get(7)?,
            expires_at: row.get(8)?,
            used: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

/// Input for [`AuthSessionStore::create`].
#[derive(Debug, Clone)]
pub struct NewAuthSession {
    pub state: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub caller_state: Option<String>,
    pub expires_at: i64,
}

/// Outcome of an attempt to consume a one-time code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redemption {
    /// This caller consumed the code; the session is now redeemed.
    Consumed(AuthSession),
    /// No session carries this code.
    Invalid,
    /// The code was consumed earlier.
    AlreadyUsed,
    /// The session expired before the code was presented.
    Expired,
}

/// Store of authorization sessions.
#[derive(Clone)]
pub struct AuthSessionStore {
    db: Database,
}

impl AuthSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new session in the `Created` phase.
    #[instrument(skip(self, session), fields(client_id = %session.client_id))]
    pub async fn create(&self, session: NewAuthSession) -> StoreResult<AuthSession> {
        let row_id = Uuid::now_v7().to_string();
        let now = Utc::now().timestamp();

        let stored = AuthSession {
            state: session.state,
            client_id: session.client_id,
            redirect_uri: session.redirect_uri,
            code_challenge: session.code_challenge,
            code_challenge_method: session.code_challenge_method,
            caller_state: session.caller_state,
            code_hash: None,
            subject: None,
            expires_at: session.expires_at,
            used: false,
            created_at: now,
        };

        let row = stored.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO auth_sessions \
                     (id, state, client_id, redirect_uri, code_challenge, code_challenge_method, \
                      caller_state, expires_at, used, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
                    rusqlite::params![
                        row_id,
                        row.state,
                        row.client_id,
                        row.redirect_uri,
                        row.code_challenge,
                        row.code_challenge_method,
                        row.caller_state,
                        row.expires_at,
                        row.created_at,
                    ],
                )
                .map_err(|e| {
                    StoreError::on_constraint(e, || {
                        "authorization session rejected: unknown client or duplicate state".into()
                    })
                })?;
                Ok(())
            })
            .await?;

        debug!(expires_at = stored.expires_at, "authorization session created");
        Ok(stored)
    }

    /// Fetch a session by state regardless of phase or expiry.
    #[instrument(skip(self, state))]
    pub async fn get(&self, state: &str) -> StoreResult<Option<AuthSession>> {
        let state = state.to_string();
        self.db
            .execute(move |conn| {
                let sql = format!("SELECT {SESSION_COLUMNS} FROM auth_sessions WHERE state = ?1");
                match conn.query_row(&sql, rusqlite::params![state], AuthSession::from_row) {
                    Ok(session) => Ok(Some(session)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Fetch a session that is still in the `Created` phase and has not
    /// expired at `now`.
    #[instrument(skip(self, state))]
    pub async fn find_pending(&self, state: &str, now: i64) -> StoreResult<Option<AuthSession>> {
        let state = state.to_string();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {SESSION_COLUMNS} FROM auth_sessions \
                     WHERE state = ?1 AND code_hash IS NULL AND used = 0 AND expires_at > ?2"
                );
                match conn.query_row(&sql, rusqlite::params![state, now], AuthSession::from_row) {
                    Ok(session) => Ok(Some(session)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Move a pending session to `Resolved` by attaching the code hash and
    /// the upstream subject.
    ///
    /// Returns `false` when no `Created`, unexpired session has this state,
    /// including when another caller resolved it first.
    #[instrument(skip(self, state, code_hash))]
    pub async fn attach_code(
        &self,
        state: &str,
        code_hash: &str,
        subject: &str,
        now: i64,
    ) -> StoreResult<bool> {
        let state = state.to_string();
        let code_hash = code_hash.to_string();
        let subject = subject.to_string();
        let updated = self
            .db
            .execute(move |conn| {
                let n = conn.execute(
                    "UPDATE auth_sessions SET code_hash = ?2, subject = ?3 \
                     WHERE state = ?1 AND code_hash IS NULL AND used = 0 AND expires_at > ?4",
                    rusqlite::params![state, code_hash, subject, now],
                )?;
                Ok(n)
            })
            .await?;

        debug!(resolved = updated == 1, "attach code to session");
        Ok(updated == 1)
    }

    /// Atomically consume the one-time code whose hash is `code_hash`.
    ///
    /// The `used` flag flips in the same statement that checks it and the
    /// expiry. Only when that statement matches nothing is the row read
    /// again, purely to report why.
    #[instrument(skip(self, code_hash))]
    pub async fn consume_code(&self, code_hash: &str, now: i64) -> StoreResult<Redemption> {
        let code_hash = code_hash.to_string();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "UPDATE auth_sessions SET used = 1 \
                     WHERE code_hash = ?1 AND used = 0 AND expires_at > ?2 \
                     RETURNING {SESSION_COLUMNS}"
                );
                match conn.query_row(&sql, rusqlite::params![code_hash, now], AuthSession::from_row)
                {
                    Ok(session) => return Ok(Redemption::Consumed(session)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => {}
                    Err(e) => return Err(StoreError::Sqlite(e)),
                }

                let existing = conn.query_row(
                    "SELECT used, expires_at FROM auth_sessions WHERE code_hash = ?1",
                    rusqlite::params![code_hash],
                    |row| Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)?)),
                );
                match existing {
                    Ok((true, _)) => Ok(Redemption::AlreadyUsed),
                    Ok((false, expires_at)) if expires_at <= now => Ok(Redemption::Expired),
                    Ok(_) | Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Redemption::Invalid),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Delete every session that expired at or before `now`, whatever its
    /// phase. Returns the number of rows removed.
    #[instrument(skip(self))]
    pub async fn delete_expired(&self, now: i64) -> StoreResult<usize> {
        let deleted = self
            .db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM auth_sessions WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?;
                Ok(n)
            })
            .await?;
        if deleted > 0 {
            debug!(deleted, "expired authorization sessions removed");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_store::{ClientStore, NewClient};

    const REDIRECT: &str = "https://app.example/cb";

    async fn setup_store() -> (Database, AuthSessionStore) {
        let db = Database::in_memory().await.unwrap();
        ClientStore::new(db.clone())
            .insert(NewClient {
                client_id: "client-1".into(),
                client_name: "Test".into(),
                redirect_uris: vec![REDIRECT.into()],
            })
            .await
            .unwrap();
        (db.clone(), AuthSessionStore::new(db))
    }

    fn new_session(state: &str, expires_at: i64) -> NewAuthSession {
        NewAuthSession {
            state: state.into(),
            client_id: "client-1".into(),
            redirect_uri: REDIRECT.into(),
            code_challenge: "challenge".into(),
            code_challenge_method: "S256".into(),
            caller_state: Some("xyz".into()),
            expires_at,
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    #[tokio::test]
    async fn create_starts_in_created_phase() {
        let (_db, store) = setup_store().await;
        let session = store.create(new_session("as.1", now() + 600)).await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Created);

        let pending = store.find_pending("as.1", now()).await.unwrap().unwrap();
        assert_eq!(pending.caller_state.as_deref(), Some("xyz"));
        assert!(!pending.is_expired(now()));
    }

    #[tokio::test]
    async fn create_rejects_unknown_client() {
        let (_db, store) = setup_store().await;
        let mut session = new_session("as.orphan", now() + 600);
        session.client_id = "ghost".into();
        assert!(matches!(
            store.create(session).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn find_pending_ignores_expired_sessions() {
        let (_db, store) = setup_store().await;
        store.create(new_session("as.old", now() - 1)).await.unwrap();
        assert!(store.find_pending("as.old", now()).await.unwrap().is_none());
        assert!(store.get("as.old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn attach_code_only_once() {
        let (_db, store) = setup_store().await;
        store.create(new_session("as.2", now() + 600)).await.unwrap();

        assert!(store.attach_code("as.2", "hash-a", "a@example.com", now()).await.unwrap());
        assert!(!store.attach_code("as.2", "hash-b", "b@example.com", now()).await.unwrap());

        let session = store.get("as.2").await.unwrap().unwrap();
        assert_eq!(session.phase(), SessionPhase::Resolved);
        assert_eq!(session.subject.as_deref(), Some("a@example.com"));
        assert!(store.find_pending("as.2", now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attach_code_rejects_expired_session() {
        let (_db, store) = setup_store().await;
        store.create(new_session("as.3", now() - 5)).await.unwrap();
        assert!(!store.attach_code("as.3", "hash", "a@example.com", now()).await.unwrap());
    }

    #[tokio::test]
    async fn consume_code_classifies_outcomes() {
        let (db, store) = setup_store().await;
        store.create(new_session("as.4", now() + 600)).await.unwrap();
        store.attach_code("as.4", "code-hash", "a@example.com", now()).await.unwrap();

        assert_eq!(store.consume_code("nope", now()).await.unwrap(), Redemption::Invalid);

        match store.consume_code("code-hash", now()).await.unwrap() {
            Redemption::Consumed(session) => {
                assert_eq!(session.phase(), SessionPhase::Redeemed);
                assert_eq!(session.subject.as_deref(), Some("a@example.com"));
            }
            other => panic!("expected Consumed, got {other:?}"),
        }
        assert_eq!(
            store.consume_code("code-hash", now()).await.unwrap(),
            Redemption::AlreadyUsed
        );

        store.create(new_session("as.5", now() + 600)).await.unwrap();
        store.attach_code("as.5", "late-hash", "a@example.com", now()).await.unwrap();
        db.execute(|conn| {
            conn.execute("UPDATE auth_sessions SET expires_at = 0 WHERE state = 'as.5'", [])?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(
            store.consume_code("late-hash", now()).await.unwrap(),
            Redemption::Expired
        );
    }

    #[tokio::test]
    async fn delete_expired_removes_only_expired() {
        let (_db, store) = setup_store().await;
        store.create(new_session("as.live", now() + 600)).await.unwrap();
        store.create(new_session("as.dead", now() - 1)).await.unwrap();

        assert_eq!(store.delete_expired(now()).await.unwrap(), 1);
        assert!(store.get("as.live").await.unwrap().is_some());
        assert!(store.get("as.dead").await.unwrap().is_none());
    }
}
