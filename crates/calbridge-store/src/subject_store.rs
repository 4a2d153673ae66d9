//! Per-subject credential records.
//!
//! One row per upstream subject (verified email). Each row holds the
//! subject's upstream OAuth token and the hash of its legacy API key. Every
//! upsert rotates the API key; the raw key is returned once and never
//! stored.

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::secret::{generate_api_key, hash_secret};

/// An OAuth token issued to us by the upstream identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Unix timestamp of access token expiry, if the provider reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl UpstreamToken {
    /// Whether the access token is expired, or will be within `margin_secs`.
    /// Tokens without an expiry never expire.
    pub fn needs_refresh(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| now + margin_secs >= expires_at)
    }

    /// Keep `previous`'s refresh token when this token came without one.
    /// Providers usually omit it on refresh and on repeat consent.
    pub fn inherit_refresh_token(mut self, previous: &UpstreamToken) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        self
    }
}

/// A subject's stored credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject: String,
    pub api_key_hash: String,
    pub upstream_token: UpstreamToken,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`SubjectStore::upsert`].
#[derive(Debug, Clone)]
pub struct SubjectUpdate {
    pub subject: String,
    pub upstream_token: UpstreamToken,
}

/// Store of per-subject credentials.
#[derive(Clone)]
pub struct SubjectStore {
    db: Database,
}

impl SubjectStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create or replace the record for `update.subject`.
    ///
    /// The upstream token is replaced (keeping the previous refresh token if
    /// the new one has none) and a fresh API key is generated. Returns the
    /// raw API key.
    #[instrument(skip(self, update), fields(subject = %update.subject))]
    pub async fn upsert(&self, update: SubjectUpdate) -> StoreResult<String> {
        let api_key = generate_api_key()?;
        let api_key_hash = hash_secret(&api_key);
        let row_id = Uuid::now_v7().to_string();
        let now = Utc::now().timestamp();

        let created = self
            .db
            .transaction(move |tx| {
                let previous: Option<String> = tx
                    .query_row(
                        "SELECT upstream_token FROM users WHERE subject = ?1",
                        rusqlite::params![update.subject],
                        |row| row.get(0),
                    )
                    .optional()?;

                let token = match previous.as_deref() {
                    Some(json) => {
                        let previous: UpstreamToken = serde_json::from_str(json)?;
                        update.upstream_token.inherit_refresh_token(&previous)
                    }
                    None => update.upstream_token,
                };
                let token_json = serde_json::to_string(&token)?;

                tx.execute(
                    "INSERT INTO users \
                     (id, subject, api_key_hash, upstream_token, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
                     ON CONFLICT(subject) DO UPDATE SET \
                       api_key_hash = excluded.api_key_hash, \
                       upstream_token = excluded.upstream_token, \
                       updated_at = excluded.updated_at",
                    rusqlite::params![row_id, update.subject, api_key_hash, token_json, now],
                )?;
                Ok(previous.is_none())
            })
            .await?;

        if created {
            info!("subject created");
        } else {
            debug!("subject credentials replaced, API key rotated");
        }
        Ok(api_key)
    }

    /// Fetch a subject's record.
    #[instrument(skip(self))]
    pub async fn get(&self, subject: &str) -> StoreResult<Option<SubjectRecord>> {
        let subject = subject.to_string();
        self.db
            .execute(move |conn| query_record(conn, "subject", subject))
            .await
    }

    /// Look up a subject by its raw legacy API key.
    #[instrument(skip(self, api_key))]
    pub async fn find_by_api_key(&self, api_key: &str) -> StoreResult<Option<SubjectRecord>> {
        let key_hash = hash_secret(api_key);
        self.db
            .execute(move |conn| query_record(conn, "api_key_hash", key_hash))
            .await
    }

    /// Replace only the upstream token of an existing subject.
    #[instrument(skip(self, token))]
    pub async fn update_upstream_token(
        &self,
        subject: &str,
        token: &UpstreamToken,
    ) -> StoreResult<()> {
        let subject = subject.to_string();
        let token_json = serde_json::to_string(token)?;
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE users SET upstream_token = ?2, updated_at = ?3 WHERE subject = ?1",
                    rusqlite::params![subject, token_json, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "subject",
                        id: subject,
                    });
                }
                Ok(())
            })
            .await
    }
}

/// Select one record by `column`, which must be a trusted column name.
fn query_record(
    conn: &rusqlite::Connection,
    column: &'static str,
    value: String,
) -> StoreResult<Option<SubjectRecord>> {
    let sql = format!(
        "SELECT subject, api_key_hash, upstream_token, created_at, updated_at \
         FROM users WHERE {column} = ?1"
    );
    let row = conn
        .query_row(&sql, rusqlite::params![value], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })
        .optional()?;

    match row {
        Some((subject, api_key_hash, token_json, created_at, updated_at)) => {
            Ok(Some(SubjectRecord {
                subject,
                api_key_hash,
                upstream_token: serde_json::from_str(&token_json)?,
                created_at,
                updated_at,
            }))
        }
        None => Ok(None),
    }
}
