//! Dynamic client registration (RFC 7591).

use calbridge_store::secret::generate_token;
use calbridge_store::{Client, ClientStore, NewClient};
use tracing::{info, instrument};
use url::Url;

use crate::error::{BrokerError, Result};

/// Bytes of entropy in a generated client identifier.
const CLIENT_ID_BYTES: usize = 16;

/// Issues client identifiers to self-registering callers.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: ClientStore,
}

impl ClientRegistry {
    pub fn new(clients: ClientStore) -> Self {
        Self { clients }
    }

    /// Register a public client. Every redirect URI must be an absolute
    /// `http` or `https` URL; the list may not be empty.
    #[instrument(skip(self, redirect_uris), fields(uris = redirect_uris.len()))]
    pub async fn register(&self, client_name: &str, redirect_uris: Vec<String>) -> Result<Client> {
        if redirect_uris.is_empty() {
            return Err(BrokerError::MissingRedirectUris);
        }
        for uri in &redirect_uris {
            validate_redirect_uri(uri)?;
        }

        let client = self
            .clients
            .insert(NewClient {
                client_id: generate_token(CLIENT_ID_BYTES)?,
                client_name: client_name.to_string(),
                redirect_uris,
            })
            .await?;

        info!(client_id = %client.client_id, client_name = %client.client_name, "client registered");
        Ok(client)
    }

    /// Look up a registered client.
    pub async fn get(&self, client_id: &str) -> Result<Client> {
        self.clients
            .get(client_id)
            .await?
            .ok_or_else(|| BrokerError::UnknownClient(client_id.to_string()))
    }
}

fn validate_redirect_uri(uri: &str) -> Result<()> {
    let parsed = Url::parse(uri).map_err(|e| BrokerError::InvalidRedirectUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(BrokerError::InvalidRedirectUri {
            uri: uri.to_string(),
            reason: format!("scheme must be http or https, got {other}"),
        }),
    }
}
