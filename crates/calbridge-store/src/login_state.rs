//! Pending correlation states of the API-key login flow.

use chrono::Utc;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;

/// Store of single-use login states.
#[derive(Clone)]
pub struct LoginStateStore {
    db: Database,
}

impl LoginStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, state))]
    pub async fn insert(&self, state: &str, expires_at: i64) -> StoreResult<()> {
        let state = state.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO login_states (state, expires_at, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![state, expires_at, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Remove `state` if it exists and is unexpired at `now`. Returns whether
    /// it did; a state can be consumed at most once.
    #[instrument(skip(self, state))]
    pub async fn consume(&self, state: &str, now: i64) -> StoreResult<bool> {
        let state = state.to_string();
        let removed = self
            .db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM login_states WHERE state = ?1 AND expires_at > ?2",
                    rusqlite::params![state, now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(removed == 1)
    }

    #[instrument(skip(self))]
    pub async fn delete_expired(&self, now: i64) -> StoreResult<usize> {
        let deleted = self
            .db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM login_states WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?;
                Ok(n)
            })
            .await?;
        if deleted > 0 {
            debug!(deleted, "expired login states removed");
        }
        Ok(deleted)
    }
}
