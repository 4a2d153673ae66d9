//! Broker-issued access/refresh token pairs.
//!
//! Only SHA-256 hashes of the tokens are stored. A pair is looked up by its
//! access hash for bearer validation and replaced wholesale on refresh.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// A stored token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub client_id: String,
    pub subject: String,
    pub access_hash: String,
    pub refresh_hash: String,
    /// Unix timestamp at which the access token stops being accepted.
    pub expires_at: i64,
    pub created_at: i64,
}

/// Input for [`TokenStore::insert`].
#[derive(Debug, Clone)]
pub struct NewTokenPair {
    pub client_id: String,
    pub subject: String,
    pub access_hash: String,
    pub refresh_hash: String,
    pub expires_at: i64,
}

/// The pair that takes over from a rotated one. Client and subject carry
/// over from the pair being replaced.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub access_hash: String,
    pub refresh_hash: String,
    pub expires_at: i64,
}

/// Outcome of [`TokenStore::rotate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// The old pair was deleted and the replacement stored.
    Rotated { subject: String },
    /// No live pair carries this refresh hash.
    Unknown,
    /// The pair exists but belongs to another client. Nothing changed.
    ClientMismatch,
}

/// Store of token pairs.
#[derive(Clone)]
pub struct TokenStore {
    db: Database,
}

impl TokenStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, pair), fields(client_id = %pair.client_id))]
    pub async fn insert(&self, pair: NewTokenPair) -> StoreResult<TokenPair> {
        let row_id = Uuid::now_v7().to_string();
        let stored = TokenPair {
            client_id: pair.client_id,
            subject: pair.subject,
            access_hash: pair.access_hash,
            refresh_hash: pair.refresh_hash,
            expires_at: pair.expires_at,
            created_at: Utc::now().timestamp(),
        };

        let row = stored.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO token_pairs \
                     (id, client_id, subject, access_hash, refresh_hash, expires_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        row_id,
                        row.client_id,
                        row.subject,
                        row.access_hash,
                        row.refresh_hash,
                        row.expires_at,
                        row.created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(expires_at = stored.expires_at, "token pair stored");
        Ok(stored)
    }

    /// Find the pair whose access token hashes to `access_hash`. Expiry is
    /// not checked here.
    #[instrument(skip(self, access_hash))]
    pub async fn find_by_access(&self, access_hash: &str) -> StoreResult<Option<TokenPair>> {
        let access_hash = access_hash.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT client_id, subject, access_hash, refresh_hash, expires_at, created_at \
                     FROM token_pairs WHERE access_hash = ?1",
                    rusqlite::params![access_hash],
                    |row| {
                        Ok(TokenPair {
                            client_id: row.get(0)?,
                            subject: row.get(1)?,
                            access_hash: row.get(2)?,
                            refresh_hash: row.get(3)?,
                            expires_at: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    },
                );
                match result {
                    Ok(pair) => Ok(Some(pair)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Replace the pair identified by `refresh_hash` with `replacement`.
    ///
    /// Pairs whose `expires_at` is before `not_before` count as unknown. The
    /// delete filters on the refresh hash, the client and the cutoff at once
    /// and runs in the same transaction as the insert, so of several
    /// concurrent rotations of one refresh token exactly one sees a row.
    #[instrument(skip(self, refresh_hash, replacement))]
    pub async fn rotate(
        &self,
        refresh_hash: &str,
        client_id: &str,
        not_before: i64,
        replacement: Replacement,
    ) -> StoreResult<Rotation> {
        let refresh_hash = refresh_hash.to_string();
        let client_id = client_id.to_string();
        let outcome = self
            .db
            .transaction(move |tx| {
                let deleted = tx.query_row(
                    "DELETE FROM token_pairs \
                     WHERE refresh_hash = ?1 AND client_id = ?2 AND expires_at >= ?3 \
                     RETURNING subject",
                    rusqlite::params![refresh_hash, client_id, not_before],
                    |row| row.get::<_, String>(0),
                );
                let subject = match deleted {
                    Ok(subject) => subject,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        let owner = tx.query_row(
                            "SELECT client_id FROM token_pairs \
                             WHERE refresh_hash = ?1 AND expires_at >= ?2",
                            rusqlite::params![refresh_hash, not_before],
                            |row| row.get::<_, String>(0),
                        );
                        return match owner {
                            Ok(_) => Ok(Rotation::ClientMismatch),
                            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Rotation::Unknown),
                            Err(e) => Err(StoreError::Sqlite(e)),
                        };
                    }
                    Err(e) => return Err(StoreError::Sqlite(e)),
                };

                tx.execute(
                    "INSERT INTO token_pairs \
                     (id, client_id, subject, access_hash, refresh_hash, expires_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        Uuid::now_v7().to_string(),
                        client_id,
                        subject,
                        replacement.access_hash,
                        replacement.refresh_hash,
                        replacement.expires_at,
                        Utc::now().timestamp(),
                    ],
                )?;
                Ok(Rotation::Rotated { subject })
            })
            .await?;

        debug!(rotated = matches!(outcome, Rotation::Rotated { .. }), "token rotation");
        Ok(outcome)
    }

    /// Delete pairs whose `expires_at` is strictly before `cutoff`.
    #[instrument(skip(self))]
    pub async fn delete_stale(&self, cutoff: i64) -> StoreResult<usize> {
        let deleted = self
            .db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM token_pairs WHERE expires_at < ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(n)
            })
            .await?;
        if deleted > 0 {
            debug!(deleted, "stale token pairs removed");
        }
        Ok(deleted)
    }

    /// Number of stored pairs.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM token_pairs", [], |row| row.get(0))?;
                Ok(n)
            })
            .await
    }
}
