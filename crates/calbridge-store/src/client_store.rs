//! Persistence for dynamically registered OAuth clients.
//!
//! Registration is append-only: there is no update or delete operation.
//! Redirect URIs are stored as a JSON array and compared byte-for-byte by
//! callers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// A registered OAuth client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Opaque, broker-generated client identifier.
    pub client_id: String,
    /// Display name supplied at registration.
    pub client_name: String,
    /// Hash of the client secret. Public clients (the only kind registered
    /// today) have none.
    pub client_secret_hash: Option<String>,
    /// Redirect URIs the client may use, in registration order.
    pub redirect_uris: Vec<String>,
    /// Unix timestamp of registration.
    pub created_at: i64,
}

impl Client {
    /// Whether `uri` exactly matches one of the registered redirect URIs.
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|registered| registered == uri)
    }
}

/// Input for [`ClientStore::insert`].
#[derive(Debug, Clone)]
pub struct NewClient {
    pub client_id: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
}

/// Append-only store of registered clients.
#[derive(Clone)]
pub struct ClientStore {
    db: Database,
}

impl ClientStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new client. Fails with [`StoreError::InvalidArgument`] if
    /// the identifier is already taken.
    #[instrument(skip(self, client), fields(client_id = %client.client_id))]
    pub async fn insert(&self, client: NewClient) -> StoreResult<Client> {
        if client.redirect_uris.is_empty() {
            return Err(StoreError::InvalidArgument(
                "a client needs at least one redirect URI".into(),
            ));
        }

        let row_id = Uuid::now_v7().to_string();
        let uris_json = serde_json::to_string(&client.redirect_uris)?;
        let now = Utc::now().timestamp();

        let stored = Client {
            client_id: client.client_id,
            client_name: client.client_name,
            client_secret_hash: None,
            redirect_uris: client.redirect_uris,
            created_at: now,
        };

        let client_id = stored.client_id.clone();
        let client_name = stored.client_name.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO oauth_clients (id, client_id, client_name, redirect_uris, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![row_id, client_id, client_name, uris_json, now],
                )
                .map_err(|e| {
                    StoreError::on_constraint(e, || {
                        format!("client_id already registered: {client_id}")
                    })
                })?;
                Ok(())
            })
            .await?;

        debug!(client_id = %stored.client_id, "client registered");
        Ok(stored)
    }

    /// Fetch a client by its identifier, returning `None` if unknown.
    #[instrument(skip(self))]
    pub async fn get(&self, client_id: &str) -> StoreResult<Option<Client>> {
        let client_id = client_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT client_id, client_name, client_secret_hash, redirect_uris, created_at \
                     FROM oauth_clients WHERE client_id = ?1",
                    rusqlite::params![client_id],
                    |row| {
                        Ok(ClientRow {
                            client_id: row.get(0)?,
                            client_name: row.get(1)?,
                            client_secret_hash: row.get(2)?,
                            redirect_uris: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                );
                match result {
                    Ok(row) => row.into_client().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Return the number of registered clients.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM oauth_clients", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
    }
}

/// Raw row data before the redirect URI list is decoded.
struct ClientRow {
    client_id: String,
    client_name: String,
    client_secret_hash: Option<String>,
    redirect_uris: String,
    created_at: i64,
}

impl ClientRow {
    fn into_client(self) -> StoreResult<Client> {
        Ok(Client {
            client_id: self.client_id,
            client_name: self.client_name,
            client_secret_hash: self.client_secret_hash,
            redirect_uris: serde_json::from_str(&self.redirect_uris)?,
            created_at: self.created_at,
        })
    }
}
